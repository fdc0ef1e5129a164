//! Closure construction errors.

use tether_runtime::{CallableRef, ContextId, RuntimeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot create closure: {0} is not live")]
    ContextNotLive(ContextId),

    #[error("cannot create closure: {0} is not live")]
    CallableNotLive(CallableRef),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
