//! Error types for Lumen.

use thiserror::Error;

/// Result type alias using Lumen's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Lumen operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No factory is registered under the requested key.
    #[error(
        "missing component [key='{key}']; check that the key is spelled correctly, \
         that a component is registered under it, and that the plugin providing it is loaded"
    )]
    ComponentNotFound {
        /// The key that was looked up.
        key: String,
    },

    /// A dynamic library (or one of its dependencies) could not be opened.
    #[error("failed to load plugin [path='{path}']: {message}")]
    PluginLoad {
        /// Path handed to the platform loader.
        path: String,
        /// Platform loader diagnostic.
        message: String,
    },

    /// The platform loader refused to close a library.
    #[error("failed to unload plugin [name='{name}']: {message}")]
    PluginUnload {
        /// Plugin name.
        name: String,
        /// Platform loader diagnostic.
        message: String,
    },

    /// The library does not export the plugin entry point.
    #[error("missing plugin entry point: lumen_plugin_descriptor")]
    MissingEntryPoint,

    /// ABI version mismatch between the plugin and the host.
    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    AbiMismatch {
        /// Expected ABI version.
        expected: u32,
        /// Actual ABI version found.
        actual: u32,
    },

    /// Plugin descriptor validation failed.
    #[error("invalid plugin descriptor: {0}")]
    InvalidDescriptor(&'static str),

    /// Locator is empty or does not start with the root sigil.
    #[error("invalid locator [loc='{0}']")]
    InvalidLocator(String),

    /// A locator segment could not be resolved.
    #[error("failed to find a component with locator [loc='{loc}', segment='{segment}']")]
    LocatorNotFound {
        /// The full locator.
        loc: String,
        /// The segment that failed to resolve.
        segment: String,
    },

    /// No root component is registered.
    #[error("root component has not been registered [loc='{0}']")]
    RootNotRegistered(String),

    /// A child name that cannot be addressed by a locator.
    #[error("invalid component name '{0}': names must be non-empty, must not be '$' and must not contain '.'")]
    InvalidName(String),

    /// The stream names a key that is not registered in this process.
    #[error("serialized component key is not registered [key='{key}']")]
    DeserializationKeyMismatch {
        /// Key read from the stream.
        key: String,
    },

    /// The stream is structurally malformed.
    #[error("malformed serialized stream: {0}")]
    DeserializationFormat(String),

    /// A worker connection dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A worker or the master did not respond in time.
    #[error("timed out: {0}")]
    TaskTimeout(String),

    /// Malformed message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The component does not support the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error only affects a single connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::TaskTimeout(_) | Error::Protocol(_) | Error::Io(_)
        )
    }
}
