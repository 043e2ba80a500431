use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use autocode_core::{current_utc_rfc3339, next_hex_id, replace_file_durably};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::graph::{would_create_cycle, DependencyGraph};
use crate::records::{
    CoverageEntry, FunctionRecord, FunctionSummary, ModificationRecord, NewFunction,
    TestResultRecord, TestStatus, UnitTestRecord,
};

const STORE_SCHEMA_VERSION: u32 = 1;
const RECORD_ID_LEN: usize = 16;

/// Function/test bookkeeping consumed by the tool surface.
pub trait FunctionStore: Send + Sync {
    fn list_functions(&self, module: Option<&str>, tag: Option<&str>) -> Vec<FunctionSummary>;
    fn get_function(&self, function_id: &str) -> StoreResult<FunctionRecord>;
    fn add_function(&self, function: NewFunction) -> StoreResult<FunctionRecord>;
    fn modify_function(
        &self,
        function_id: &str,
        modifier: &str,
        description: &str,
        code: &str,
    ) -> StoreResult<ModificationRecord>;
    fn delete_function(&self, function_id: &str) -> StoreResult<()>;
    fn add_test(
        &self,
        function_id: &str,
        name: &str,
        description: &str,
        code: &str,
    ) -> StoreResult<UnitTestRecord>;
    /// Drops stored results for the given functions ahead of a fresh run.
    fn clear_test_results(&self, function_ids: &[String]) -> StoreResult<()>;
    fn record_test_result(&self, result: TestResultRecord) -> StoreResult<()>;
    fn test_results(&self, function_id: Option<&str>) -> Vec<TestResultRecord>;
    fn coverage_report(&self) -> Vec<CoverageEntry>;
    fn search_functions(&self, query: &str) -> Vec<FunctionSummary>;
    fn list_modifications(&self, function_id: &str) -> Vec<ModificationRecord>;
    fn list_dependencies(&self, function_id: &str) -> StoreResult<Vec<String>>;
    fn add_dependency(&self, function_id: &str, depends_on_id: &str) -> StoreResult<()>;
    fn remove_dependency(&self, function_id: &str, depends_on_id: &str) -> StoreResult<()>;
    fn dependency_graph(&self) -> DependencyGraph;
    fn list_modules(&self) -> Vec<String>;
    fn list_tags(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    functions: BTreeMap<String, FunctionRecord>,
    #[serde(default)]
    test_results: Vec<TestResultRecord>,
    #[serde(default)]
    modifications: Vec<ModificationRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            functions: BTreeMap::new(),
            test_results: Vec::new(),
            modifications: Vec::new(),
        }
    }
}

fn default_schema_version() -> u32 {
    STORE_SCHEMA_VERSION
}

impl StoreDocument {
    fn function(&self, function_id: &str) -> StoreResult<&FunctionRecord> {
        self.functions
            .get(function_id)
            .ok_or_else(|| StoreError::FunctionNotFound(function_id.to_string()))
    }

    fn function_mut(&mut self, function_id: &str) -> StoreResult<&mut FunctionRecord> {
        self.functions
            .get_mut(function_id)
            .ok_or_else(|| StoreError::FunctionNotFound(function_id.to_string()))
    }

    fn graph(&self) -> DependencyGraph {
        self.functions
            .iter()
            .map(|(id, record)| (id.clone(), record.dependencies.clone()))
            .collect()
    }

    fn latest_status(&self, test_id: &str) -> Option<TestStatus> {
        self.test_results
            .iter()
            .rev()
            .find(|result| result.test_id == test_id)
            .map(|result| result.status)
    }
}

/// JSON-document store, rewritten atomically after every mutation.
///
/// Without a path the store lives only in memory.
#[derive(Debug)]
pub struct JsonFunctionStore {
    path: Option<PathBuf>,
    state: RwLock<StoreDocument>,
}

impl JsonFunctionStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let document = if path.exists() {
            load_document(&path)?
        } else {
            StoreDocument::default()
        };
        tracing::debug!(
            path = %path.display(),
            functions = document.functions.len(),
            "opened function store"
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(document),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreDocument::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreDocument> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreDocument> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Applies `change` to a copy, persists it, then publishes it. A failed
    /// change or write leaves the visible state untouched.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut StoreDocument) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.write();
        let mut draft = guard.clone();
        let value = change(&mut draft)?;
        if let Some(path) = self.path.as_deref() {
            persist_document(path, &draft)?;
        }
        *guard = draft;
        Ok(value)
    }
}

fn load_document(path: &Path) -> StoreResult<StoreDocument> {
    let raw = std::fs::read_to_string(path).map_err(|error| StoreError::Load {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    if raw.trim().is_empty() {
        return Ok(StoreDocument::default());
    }
    serde_json::from_str(&raw).map_err(|error| StoreError::Load {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

fn persist_document(path: &Path, document: &StoreDocument) -> StoreResult<()> {
    let persist_error = |message: String| StoreError::Persist {
        path: path.to_path_buf(),
        message,
    };
    let encoded =
        serde_json::to_string_pretty(document).map_err(|error| persist_error(error.to_string()))?;
    replace_file_durably(path, encoded.as_bytes())
        .map_err(|error| persist_error(format!("{error:#}")))
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !values.iter().any(|existing| existing == value) {
        values.push(value.to_string());
    }
}

fn sorted_summaries<'a>(records: impl Iterator<Item = &'a FunctionRecord>) -> Vec<FunctionSummary> {
    let mut summaries = records.map(FunctionRecord::summary).collect::<Vec<_>>();
    summaries.sort_by(|left, right| left.name.cmp(&right.name).then(left.id.cmp(&right.id)));
    summaries
}

impl FunctionStore for JsonFunctionStore {
    fn list_functions(&self, module: Option<&str>, tag: Option<&str>) -> Vec<FunctionSummary> {
        let state = self.read();
        sorted_summaries(state.functions.values().filter(|record| {
            module.is_none_or(|module| record.modules.iter().any(|entry| entry == module))
                && tag.is_none_or(|tag| record.tags.iter().any(|entry| entry == tag))
        }))
    }

    fn get_function(&self, function_id: &str) -> StoreResult<FunctionRecord> {
        self.read().function(function_id).cloned()
    }

    fn add_function(&self, function: NewFunction) -> StoreResult<FunctionRecord> {
        let record = self.mutate(|document| {
            let now = current_utc_rfc3339();
            let mut record = FunctionRecord {
                id: next_hex_id(RECORD_ID_LEN),
                name: function.name.trim().to_string(),
                description: function.description,
                code: function.code,
                modules: Vec::new(),
                tags: Vec::new(),
                dependencies: Vec::new(),
                tests: Vec::new(),
                created_at: now.clone(),
                modified_at: now,
            };
            for module in &function.modules {
                push_unique(&mut record.modules, module);
            }
            for tag in &function.tags {
                push_unique(&mut record.tags, tag);
            }
            document.functions.insert(record.id.clone(), record.clone());
            Ok(record)
        })?;
        tracing::debug!(function_id = %record.id, name = %record.name, "added function");
        Ok(record)
    }

    fn modify_function(
        &self,
        function_id: &str,
        modifier: &str,
        description: &str,
        code: &str,
    ) -> StoreResult<ModificationRecord> {
        self.mutate(|document| {
            let now = current_utc_rfc3339();
            let record = document.function_mut(function_id)?;
            record.code = code.to_string();
            record.modified_at = now.clone();
            let modification = ModificationRecord {
                id: next_hex_id(RECORD_ID_LEN),
                function_id: function_id.to_string(),
                modifier: modifier.to_string(),
                description: description.to_string(),
                recorded_at: now,
            };
            document.modifications.push(modification.clone());
            Ok(modification)
        })
    }

    fn delete_function(&self, function_id: &str) -> StoreResult<()> {
        self.mutate(|document| {
            if document.functions.remove(function_id).is_none() {
                return Err(StoreError::FunctionNotFound(function_id.to_string()));
            }
            for record in document.functions.values_mut() {
                record.dependencies.retain(|dependency| dependency != function_id);
            }
            document
                .test_results
                .retain(|result| result.function_id != function_id);
            document
                .modifications
                .retain(|modification| modification.function_id != function_id);
            Ok(())
        })?;
        tracing::debug!(function_id, "deleted function");
        Ok(())
    }

    fn add_test(
        &self,
        function_id: &str,
        name: &str,
        description: &str,
        code: &str,
    ) -> StoreResult<UnitTestRecord> {
        self.mutate(|document| {
            let record = document.function_mut(function_id)?;
            let test = UnitTestRecord {
                id: next_hex_id(RECORD_ID_LEN),
                function_id: function_id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                code: code.to_string(),
            };
            record.tests.push(test.clone());
            record.modified_at = current_utc_rfc3339();
            Ok(test)
        })
    }

    fn clear_test_results(&self, function_ids: &[String]) -> StoreResult<()> {
        self.mutate(|document| {
            document
                .test_results
                .retain(|result| !function_ids.contains(&result.function_id));
            Ok(())
        })
    }

    fn record_test_result(&self, result: TestResultRecord) -> StoreResult<()> {
        self.mutate(|document| {
            let owner = document.function(&result.function_id)?;
            if !owner.tests.iter().any(|test| test.id == result.test_id) {
                return Err(StoreError::TestNotFound(result.test_id.clone()));
            }
            document.test_results.push(result);
            Ok(())
        })
    }

    fn test_results(&self, function_id: Option<&str>) -> Vec<TestResultRecord> {
        self.read()
            .test_results
            .iter()
            .filter(|result| function_id.is_none_or(|id| result.function_id == id))
            .cloned()
            .collect()
    }

    fn coverage_report(&self) -> Vec<CoverageEntry> {
        let state = self.read();
        let mut report = state
            .functions
            .values()
            .map(|record| {
                let mut passed = 0;
                let mut failed = 0;
                for test in &record.tests {
                    match state.latest_status(&test.id) {
                        Some(TestStatus::Passed) => passed += 1,
                        Some(TestStatus::Failed) => failed += 1,
                        None => {}
                    }
                }
                let num_tests = record.tests.len();
                let coverage_percent = if num_tests == 0 {
                    0.0
                } else {
                    passed as f64 / num_tests as f64 * 100.0
                };
                CoverageEntry {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    num_tests,
                    passed,
                    failed,
                    untested: num_tests == 0,
                    coverage_percent,
                }
            })
            .collect::<Vec<_>>();
        report.sort_by(|left, right| left.name.cmp(&right.name));
        report
    }

    fn search_functions(&self, query: &str) -> Vec<FunctionSummary> {
        let needle = query.trim().to_lowercase();
        let state = self.read();
        sorted_summaries(state.functions.values().filter(|record| {
            record.name.to_lowercase().contains(&needle)
                || record.description.to_lowercase().contains(&needle)
                || record.code.to_lowercase().contains(&needle)
        }))
    }

    fn list_modifications(&self, function_id: &str) -> Vec<ModificationRecord> {
        self.read()
            .modifications
            .iter()
            .filter(|modification| modification.function_id == function_id)
            .cloned()
            .collect()
    }

    fn list_dependencies(&self, function_id: &str) -> StoreResult<Vec<String>> {
        Ok(self.read().function(function_id)?.dependencies.clone())
    }

    fn add_dependency(&self, function_id: &str, depends_on_id: &str) -> StoreResult<()> {
        self.mutate(|document| {
            document.function(function_id)?;
            if function_id == depends_on_id {
                return Err(StoreError::SelfDependency(function_id.to_string()));
            }
            document.function(depends_on_id)?;
            let record = document.function(function_id)?;
            if record.dependencies.iter().any(|id| id == depends_on_id) {
                return Err(StoreError::DependencyExists {
                    function_id: function_id.to_string(),
                    depends_on_id: depends_on_id.to_string(),
                });
            }
            if would_create_cycle(&document.graph(), function_id, depends_on_id) {
                return Err(StoreError::CircularDependency {
                    function_id: function_id.to_string(),
                    depends_on_id: depends_on_id.to_string(),
                });
            }
            document
                .function_mut(function_id)?
                .dependencies
                .push(depends_on_id.to_string());
            Ok(())
        })
    }

    fn remove_dependency(&self, function_id: &str, depends_on_id: &str) -> StoreResult<()> {
        self.mutate(|document| {
            let record = document.function_mut(function_id)?;
            let before = record.dependencies.len();
            record.dependencies.retain(|id| id != depends_on_id);
            if record.dependencies.len() == before {
                return Err(StoreError::DependencyNotFound {
                    function_id: function_id.to_string(),
                    depends_on_id: depends_on_id.to_string(),
                });
            }
            Ok(())
        })
    }

    fn dependency_graph(&self) -> DependencyGraph {
        self.read().graph()
    }

    fn list_modules(&self) -> Vec<String> {
        let state = self.read();
        state
            .functions
            .values()
            .flat_map(|record| record.modules.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn list_tags(&self) -> Vec<String> {
        let state = self.read();
        state
            .functions
            .values()
            .flat_map(|record| record.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
