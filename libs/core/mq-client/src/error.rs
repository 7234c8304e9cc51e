//! Error types for the producer and consumer clients.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which side of the broker a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// Where a client's configuration came from.
///
/// Re-initialization reuses the last source; a URL/path wins over a
/// structured config when both were used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitSource {
    /// A URL or local path to a YAML document.
    Location(String),
    /// A structured `MqConfig` handed over by the application.
    Config,
}

impl fmt::Display for InitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitSource::Location(location) => write!(f, "configuration at {}", location),
            InitSource::Config => write!(f, "structured configuration"),
        }
    }
}

/// Coarse classification of an [`MqError`].
///
/// # Kinds
///
/// - **ConfigFetch / ConfigParse**: the configuration could not be obtained
/// - **Connection / Start**: the broker connection could not be built or started
/// - **Subscribe / Send**: a per-operation failure
/// - **Shutdown**: closing the connection failed
/// - **HealthCheck**: reported by the periodic connection check
/// - **Usage**: the caller did something the client does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigFetch,
    ConfigParse,
    Connection,
    Start,
    Subscribe,
    Send,
    Shutdown,
    HealthCheck,
    Usage,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigFetch | ErrorKind::Connection | ErrorKind::Start | ErrorKind::Send
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConfigFetch => write!(f, "config_fetch"),
            ErrorKind::ConfigParse => write!(f, "config_parse"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Start => write!(f, "start"),
            ErrorKind::Subscribe => write!(f, "subscribe"),
            ErrorKind::Send => write!(f, "send"),
            ErrorKind::Shutdown => write!(f, "shutdown"),
            ErrorKind::HealthCheck => write!(f, "health_check"),
            ErrorKind::Usage => write!(f, "usage"),
        }
    }
}

/// Error returned by every client operation.
///
/// The type is `Clone` so the same error can be returned to the caller,
/// handed to a callback and kept as the client's last close error.
#[derive(Debug, Clone, Error)]
pub enum MqError {
    /// No URL or path was ever supplied
    #[error("configuration source is empty")]
    EmptySource,

    /// HTTP download of the configuration failed
    #[error("failed to download configuration from {url}: {message}")]
    Fetch { url: String, message: String },

    /// Local configuration file could not be read
    #[error("failed to read configuration file {path}: {message}")]
    Read { path: String, message: String },

    /// Configuration document is not valid YAML for `MqConfig`
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration parsed but holds unusable values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation needs a connection but the client has none
    #[error("{0} client is not initialized")]
    NotInitialized(Role),

    /// The broker library refused to build a connection
    #[error("failed to create {role} connection: {message}")]
    Connect { role: Role, message: String },

    #[error("invalid topic `{topic}`: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("failed to subscribe to `{topic}`: {message}")]
    Subscribe { topic: String, message: String },

    #[error("failed to start {role}: {message}")]
    Start { role: Role, message: String },

    #[error("failed to send to `{topic}`: {message}")]
    Send { topic: String, message: String },

    #[error("send to `{topic}` timed out after {timeout:?}")]
    SendTimeout { topic: String, timeout: Duration },

    #[error("failed to shut down {role}: {message}")]
    Shutdown { role: Role, message: String },

    /// Health check found no live connection and re-initialized from `via`
    #[error("consumer connection was lost, re-initialized from {via}")]
    ConnectionLost { via: InitSource },

    /// Health check found no live connection and nothing to rebuild it from
    #[error("consumer connection was lost and no configuration is recorded to rebuild it")]
    NoInitSource,

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Two failures from one operation (e.g. start failed, then shutdown failed)
    #[error("{first}; then {second}")]
    Joined {
        first: Box<MqError>,
        second: Box<MqError>,
    },
}

impl MqError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqError::EmptySource | MqError::Fetch { .. } | MqError::Read { .. } => {
                ErrorKind::ConfigFetch
            }
            MqError::Parse(_) | MqError::InvalidConfig(_) => ErrorKind::ConfigParse,
            MqError::Connect { .. } => ErrorKind::Connection,
            MqError::Start { .. } => ErrorKind::Start,
            MqError::Subscribe { .. } => ErrorKind::Subscribe,
            MqError::Send { .. } | MqError::SendTimeout { .. } => ErrorKind::Send,
            MqError::Shutdown { .. } => ErrorKind::Shutdown,
            MqError::ConnectionLost { .. } | MqError::NoInitSource => ErrorKind::HealthCheck,
            MqError::NotInitialized(_)
            | MqError::InvalidTopic { .. }
            | MqError::InvalidMessage(_)
            | MqError::Serialization(_) => ErrorKind::Usage,
            MqError::Joined { first, .. } => first.kind(),
        }
    }

    /// Check if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Join two failures of the same operation, keeping the first as primary.
    pub fn join(first: MqError, second: MqError) -> Self {
        MqError::Joined {
            first: Box::new(first),
            second: Box::new(second),
        }
    }

    /// Create a connect error for the given role.
    pub fn connect(role: Role, message: impl fmt::Display) -> Self {
        MqError::Connect {
            role,
            message: message.to_string(),
        }
    }

    /// Create a start error for the given role.
    pub fn start(role: Role, message: impl fmt::Display) -> Self {
        MqError::Start {
            role,
            message: message.to_string(),
        }
    }

    /// Create a shutdown error for the given role.
    pub fn shutdown(role: Role, message: impl fmt::Display) -> Self {
        MqError::Shutdown {
            role,
            message: message.to_string(),
        }
    }

    /// Create a send error.
    pub fn send(topic: impl Into<String>, message: impl fmt::Display) -> Self {
        MqError::Send {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    /// Create a subscribe error.
    pub fn subscribe(topic: impl Into<String>, message: impl fmt::Display) -> Self {
        MqError::Subscribe {
            topic: topic.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for MqError {
    fn from(e: serde_json::Error) -> Self {
        MqError::Serialization(e.to_string())
    }
}

impl From<core_config::ConfigError> for MqError {
    fn from(e: core_config::ConfigError) -> Self {
        MqError::InvalidConfig(e.to_string())
    }
}
