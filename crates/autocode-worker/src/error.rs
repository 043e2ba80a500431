use thiserror::Error;

/// Failures while bringing a worker process up.
///
/// Script evaluation never surfaces these directly: the runner folds them into a
/// failed [`crate::RunOutcome`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to write worker bootstrap script: {0}")]
    Bootstrap(#[source] std::io::Error),
    #[error("failed to create worker output pipe: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker process '{0}' did not expose a stdin handle")]
    MissingStdin(String),
}
