use std::path::PathBuf;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Function ID '{0}' not found.")]
    FunctionNotFound(String),
    #[error("Test ID '{0}' not found.")]
    TestNotFound(String),
    #[error("Function '{function_id}' does not depend on '{depends_on_id}'.")]
    DependencyNotFound {
        function_id: String,
        depends_on_id: String,
    },
    #[error("Function '{function_id}' already depends on '{depends_on_id}'.")]
    DependencyExists {
        function_id: String,
        depends_on_id: String,
    },
    #[error("Function '{0}' cannot depend on itself.")]
    SelfDependency(String),
    #[error(
        "Adding this dependency would create a circular dependency between '{function_id}' and '{depends_on_id}'."
    )]
    CircularDependency {
        function_id: String,
        depends_on_id: String,
    },
    #[error("failed to persist store to {path}: {message}")]
    Persist { path: PathBuf, message: String },
    #[error("failed to load store from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

impl StoreError {
    /// Stable machine-readable kind used in structured tool errors.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::FunctionNotFound(_) => "FunctionNotFound",
            Self::TestNotFound(_) => "TestNotFound",
            Self::DependencyNotFound { .. } => "DependencyNotFound",
            Self::DependencyExists { .. } => "DependencyExists",
            Self::SelfDependency(_) => "SelfDependency",
            Self::CircularDependency { .. } => "CircularDependency",
            Self::Persist { .. } => "PersistFailed",
            Self::Load { .. } => "LoadFailed",
        }
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::FunctionNotFound(_) => "Check the function ID or create the function first.",
            Self::TestNotFound(_) => "List the function's tests to find a valid test ID.",
            Self::DependencyNotFound { .. } => "Check the dependency list for the function.",
            Self::DependencyExists { .. } => "The dependency is already recorded; no change needed.",
            Self::SelfDependency(_) => "Use detect_recursion to inspect self-referencing code.",
            Self::CircularDependency { .. } => "Review the dependency graph and avoid cycles.",
            Self::Persist { .. } => "Check that the store path is writable.",
            Self::Load { .. } => "Repair or move the store file and restart the server.",
        }
    }
}
