use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use serde_json::Error as JsonError;

#[cfg(feature = "service")]
use rumqttc::{ClientError as MqttClientError, ConnectReturnCode, ConnectionError as MqttConnectionError};

#[cfg(feature = "service")]
use sqlx::Error as SqlxError;

/// Primary SQLite result codes we classify explicitly. sqlx reports the extended
/// code, so the low byte is compared.
#[cfg(feature = "service")]
const SQLITE_BUSY: i32 = 5;
#[cfg(feature = "service")]
const SQLITE_LOCKED: i32 = 6;
#[cfg(feature = "service")]
const SQLITE_AUTH: i32 = 23;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum SyncError {
    #[error("Malformed namespace path: {0}")]
    MalformedPath(String),
    #[error("Payload validation failed: {0}")]
    PayloadValidation(String),
    #[error("Transient graph store error: {0}")]
    TransientStore(String),
    #[error("Transient transport error: {0}")]
    TransientTransport(String),
    #[error("Store session pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Connection lost after {attempts} attempts. Last error: {last_error}")]
    ConnectionLost { attempts: u32, last_error: String },
    #[error("Authentication rejected: {0}")]
    Authentication(String),
    #[error("Graph store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl SyncError {
    /// Errors worth retrying with backoff. Pool exhaustion is handled like a
    /// transient store failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientStore(_)
                | SyncError::TransientTransport(_)
                | SyncError::PoolExhausted(_)
        )
    }

    /// Errors that terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Authentication(_) | SyncError::Config(_))
    }

    /// Errors local to a single message: the message is dropped and counted.
    pub fn is_dropped_message(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedPath(_) | SyncError::PayloadValidation(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Authentication(_) => 2,
            SyncError::Config(_) => 3,
            _ => 1,
        }
    }
}

impl From<JsonError> for SyncError {
    fn from(src: JsonError) -> SyncError {
        SyncError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(src: toml::de::Error) -> SyncError {
        SyncError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(src: toml::ser::Error) -> SyncError {
        SyncError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<io::Error> for SyncError {
    fn from(x: io::Error) -> Self {
        SyncError::Io(format!("IOError {}: {x}", x.kind()))
    }
}

impl From<fmt::Error> for SyncError {
    fn from(x: fmt::Error) -> Self {
        SyncError::Serialization(format!("{x}"))
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for SyncError {
    fn from(db_error: SqlxError) -> Self {
        match &db_error {
            SqlxError::PoolTimedOut => SyncError::PoolExhausted(format!("{db_error}")),
            SqlxError::Io(_)
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed
            | SqlxError::Protocol(_) => SyncError::TransientStore(format!("{db_error}")),
            SqlxError::Database(db) => match db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff)
            {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => {
                    SyncError::TransientStore(format!("database busy: {db_error}"))
                }
                Some(SQLITE_AUTH) => SyncError::Authentication(format!("{db_error}")),
                _ => SyncError::Store(format!("database error: {db_error}")),
            },
            SqlxError::Configuration(_) => SyncError::Config(format!("{db_error}")),
            SqlxError::Migrate(_) => SyncError::Store(format!("migration failed: {db_error}")),
            _ => SyncError::Store(format!("database error: {db_error:?}")),
        }
    }
}

#[cfg(feature = "service")]
impl From<MqttConnectionError> for SyncError {
    fn from(mqtt_error: MqttConnectionError) -> Self {
        match &mqtt_error {
            MqttConnectionError::ConnectionRefused(
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized,
            ) => SyncError::Authentication(format!("broker refused credentials: {mqtt_error}")),
            MqttConnectionError::ConnectionRefused(code) => {
                SyncError::TransientTransport(format!("broker refused connection: {code:?}"))
            }
            _ => SyncError::TransientTransport(format!("{mqtt_error}")),
        }
    }
}

#[cfg(feature = "service")]
impl From<MqttClientError> for SyncError {
    fn from(client_error: MqttClientError) -> Self {
        SyncError::TransientTransport(format!("mqtt request could not be queued: {client_error}"))
    }
}
