//! Error type for simulation, trials and sweeps.

use std::path::PathBuf;

use overiva_core::BssError;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("Position {position:?} is outside the room {dim:?}")]
    OutsideRoom { position: [f64; 3], dim: [f64; 3] },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unknown RT60 entry '{0}'")]
    UnknownRt60(String),

    #[error("Separation error: {0}")]
    Bss(#[from] BssError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SimError::Io {
            path: path.into(),
            source,
        }
    }
}
