use crate::manager::ManagerState;

/// Failure reported by a source account.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source is not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure surfaced by the [`MultiManager`](crate::MultiManager).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("source '{name}' failed: {error}")]
    Source {
        name: String,
        #[source]
        error: SourceError,
    },

    #[error("failed to create source: {0:#}")]
    Factory(anyhow::Error),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },
}

impl Error {
    pub(crate) fn source_failed(name: &str, error: SourceError) -> Self {
        Error::Source {
            name: name.to_string(),
            error,
        }
    }
}
