//! Engine API errors.

use crate::handle::{CallableRef, ContextId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} is not live")]
    ContextNotLive(ContextId),

    #[error("{0} is not live")]
    CallableNotLive(CallableRef),

    #[error("{0} is still executing and cannot be destroyed")]
    ContextBusy(ContextId),

    #[error("{watched} is already watched by this notifier")]
    DuplicateWatch { watched: CallableRef },

    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
