use monitorkit::WaitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrillError {
    #[error("unknown drill '{0}'")]
    UnknownDrill(String),

    #[error("invalid value for {knob}: '{value}' ({reason})")]
    InvalidValue {
        knob: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),

    #[error("drill wait failed: {0}")]
    Wait(#[from] WaitError),
}

pub type Result<T> = std::result::Result<T, DrillError>;
