//! Crate-wide error type.
//!
//! Each layer has its own error enum. `LwlaError` gathers them so that
//! operations touching several layers can use `?` throughout.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::scheduler::ResourceError;
use crate::session::SessionError;
use crate::transport::TransferError;
use crate::trigger_config::TriggerConfigError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LwlaError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Trigger configuration error: {0}")]
    Trigger(#[from] TriggerConfigError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, LwlaError>;
