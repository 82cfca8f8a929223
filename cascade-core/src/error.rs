//! Error types for the propagation engine.

use std::time::Duration;

use thiserror::Error;

use crate::graph::NodeId;

pub type Result<T> = std::result::Result<T, FrpError>;

#[derive(Debug, Error)]
pub enum FrpError {
    /// A loop placeholder was sampled, or the network was fed, before `bind`.
    #[error("loop placeholder {node} used before it was bound")]
    UnboundLoop { node: NodeId },

    #[error("loop placeholder {node} is already bound")]
    LoopAlreadyBound { node: NodeId },

    #[error("propagation lock not acquired within {waited:?}")]
    LockTimeout { waited: Duration },

    /// Callbacks failed while a transaction drained. The transaction still
    /// ran to completion.
    #[error("{count} callback(s) failed during the transaction; first: {first}")]
    CallbackFailed { count: usize, first: String },

    #[error("node {node} has been disposed")]
    Disposed { node: NodeId },

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FrpError {
    /// Whether this error comes from wiring the network incorrectly rather
    /// than from running it.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FrpError::UnboundLoop { .. }
                | FrpError::LoopAlreadyBound { .. }
                | FrpError::Config(_)
                | FrpError::InvalidConfig(_)
        )
    }
}
