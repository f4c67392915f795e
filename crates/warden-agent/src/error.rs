use warden_process::ComponentId;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} is not running")]
    NotRunning(ComponentId),

    #[error("{what} timed out after {elapsed_ms}ms")]
    Timeout { what: String, elapsed_ms: u64 },

    #[error("refused to stop pid {pid}: {reason}")]
    SafetyRejected { pid: u32, reason: String },

    #[error("process error: {context}")]
    Process {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{failed} of {total} operations failed")]
    PartialFailure { failed: usize, total: usize },
}

impl OrchestratorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn process(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Process {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code, used in reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRunning(_) => "not_running",
            Self::Timeout { .. } => "timeout",
            Self::SafetyRejected { .. } => "safety_rejected",
            Self::Process { .. } => "process_error",
            Self::Configuration(_) => "configuration_error",
            Self::PartialFailure { .. } => "partial_failure",
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
