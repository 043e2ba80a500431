use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTestRecord {
    pub id: String,
    pub function_id: String,
    pub name: String,
    pub description: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tests: Vec<UnitTestRecord>,
    pub created_at: String,
    pub modified_at: String,
}

impl FunctionRecord {
    pub fn summary(&self) -> FunctionSummary {
        FunctionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            modules: self.modules.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Listing view of a function, without code or tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub modules: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFunction {
    pub name: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultRecord {
    pub test_id: String,
    pub function_id: String,
    pub status: TestStatus,
    pub output: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub id: String,
    pub function_id: String,
    pub modifier: String,
    pub description: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub id: String,
    pub name: String,
    pub num_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub untested: bool,
    pub coverage_percent: f64,
}
