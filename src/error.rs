use crate::types::StackId;

/// Error taxonomy for a batch run.
///
/// Categories:
/// - Config: batch file is malformed, fatal before scheduling
/// - Allocation / Setup: stack could not be obtained or initialized, fatal to the command
/// - Execution: process failed, retryable for flaky commands
/// - Cancelled: batch-wide cancellation, never retried
/// - Bailed / CommandsFailed: batch-level outcome
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid batch configuration: {0}")]
    Config(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Stack allocation failed for pipeline '{pipeline}': {message}")]
    Allocation { pipeline: String, message: String },

    #[error("Stack setup failed for {stack}: {message}")]
    Setup { stack: StackId, message: String },

    #[error("Command '{command}' failed: {message}")]
    Execution { command: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Batch aborted: command '{command}' failed: {message}")]
    Bailed { command: String, message: String },

    #[error("{} command(s) failed: {}", .0.len(), .0.join(", "))]
    CommandsFailed(Vec<String>),

    #[error("Report error: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Returns true if the error came from the batch cancellation token.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BatchError::Cancelled)
    }

    /// Returns true if a flaky command may be re-run after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::Execution { .. })
    }
}
