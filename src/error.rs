//! Pipeline error types.

use thiserror::Error;

/// Pipeline error type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage transformation failed for one item.
    #[error("Stage '{stage}' failed on item {index}: {source}")]
    Transform {
        stage: String,
        index: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A sequencer's input ended while items were still waiting on a missing index.
    #[error("Sequence gap after stage '{stage}': index {next_expected} never arrived ({buffered} items stranded)")]
    SequenceGap {
        stage: String,
        next_expected: u64,
        buffered: usize,
    },

    /// The same index reached a sequencer twice.
    #[error("Duplicate index {index} after stage '{stage}'")]
    DuplicateIndex { stage: String, index: u64 },

    /// An index below the release point reached a sequencer.
    #[error("Stale index {index} after stage '{stage}' (next expected {next_expected})")]
    StaleIndex {
        stage: String,
        index: u64,
        next_expected: u64,
    },

    /// A stage worker panicked or was torn down unexpectedly.
    #[error("Stage '{stage}' worker terminated: {message}")]
    StageTask { stage: String, message: String },

    /// The run was cancelled from outside.
    #[error("Pipeline run cancelled")]
    Cancelled,

    /// Every permitted attempt failed.
    #[error("Gave up after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        last: Box<PipelineError>,
    },

    /// The sink refused a result.
    #[error("Sink rejected item: {0}")]
    Sink(#[source] anyhow::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Whether a whole-run retry can recover from this error.
    ///
    /// Only transformation failures qualify. Ordering faults are wiring bugs
    /// and a fresh attempt would hit them again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transform { .. })
    }

    /// Whether this error is a reorder-buffer invariant violation.
    pub fn is_ordering_fault(&self) -> bool {
        matches!(
            self,
            PipelineError::SequenceGap { .. }
                | PipelineError::DuplicateIndex { .. }
                | PipelineError::StaleIndex { .. }
        )
    }
}

/// Pipeline result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
