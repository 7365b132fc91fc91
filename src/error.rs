use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Storage unavailable at {0}")]
    StorageUnavailable(String),

    #[error("Matter port {0} already in use")]
    PortInUse(u16),

    #[error("Plugin {plugin}: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Accessory platform {0} already owns a device")]
    TooManyDevices(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate device storage key: {0}")]
    DuplicateKey(String),

    #[error("Invalid device {key}: {reason}")]
    InvalidDevice { key: String, reason: String },

    #[error("Parent {0} is not installed yet")]
    NotReady(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Matter engine error: {0}")]
    Engine(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl BridgeError {
    /// Shorthand for plugin-scoped errors.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
