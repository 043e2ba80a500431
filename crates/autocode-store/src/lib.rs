//! Function store, dependency analysis, linter and generator seam used by the
//! autocode tool surface.

pub mod error;
pub mod generator;
pub mod graph;
pub mod linter;
pub mod records;
pub mod signature;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use generator::{FunctionGenerator, GeneratedFunction, GeneratedTest};
pub use graph::{
    detect_recursion, find_cycles, would_create_cycle, DependencyGraph, RecursionReport,
};
pub use linter::{
    CodeLinter, CompatibilityLinter, LintIssue, LintReport, LintSeverity, LinterConfig,
};
pub use records::{
    CoverageEntry, FunctionRecord, FunctionSummary, ModificationRecord, NewFunction,
    TestResultRecord, TestStatus, UnitTestRecord,
};
pub use signature::{parse_signature, scan_signatures, FunctionParameter, FunctionSignature};
pub use store::{FunctionStore, JsonFunctionStore};
