use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub name: String,
    pub description: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFunction {
    pub name: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub tests: Vec<GeneratedTest>,
}

/// Source of new function code from a natural-language description.
///
/// The server only streams, lints and stores what a generator returns; no
/// generator ships with the workspace.
pub trait FunctionGenerator: Send + Sync {
    fn generate(&self, description: &str, module: Option<&str>) -> Result<GeneratedFunction>;
}
