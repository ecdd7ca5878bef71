use std::time::Duration;

use pyra_process::SupervisorError;
use thiserror::Error;

use crate::inspection::Generation;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("the debuggee is not paused")]
    NotPaused,

    #[error("reference from generation {requested} is stale (current generation is {current})")]
    StaleGeneration {
        requested: Generation,
        current: Generation,
    },

    #[error("the debug session has terminated")]
    SessionTerminated,

    #[error("`{command}` request timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("debug adapter rejected `{command}`: {message}")]
    AdapterRejected { command: String, message: String },

    #[error("`{module}` is not usable with {interpreter} (install it with `pip install {module}`): {detail}")]
    AdapterUnavailable {
        module: String,
        interpreter: String,
        detail: String,
    },

    #[error("could not connect to the debug adapter at {addr} after {attempts} attempts: {detail}")]
    Connect {
        addr: String,
        attempts: u32,
        detail: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected `{command}` response: {reason}")]
    InvalidResponse { command: String, reason: String },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
