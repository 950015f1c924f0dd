use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CdbError>;

/// Error kinds surfaced by stores, engines and the connection.
#[derive(Debug, Error)]
pub enum CdbError {
    /// Row, cell or timestamp absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request exceeds a store's time-window cap.
    #[error("range too large: {0}")]
    RangeTooLarge(String),

    /// Malformed key, metric, timestamp or option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutating call on a read-only connection.
    #[error("connection is read-only")]
    ReadOnly,

    /// Call before `service_init` / `database_init`.
    #[error("connection not initialised")]
    NotInitialised,

    /// Second `database_init` without `force`.
    #[error("database already initialised")]
    AlreadyInitialised,

    /// The metric's `delete_possible` flag is false.
    #[error("delete not allowed on metric {0}")]
    DeleteNotAllowed(String),

    /// Tag mismatch, truncated payload or bad msgpack in a stored cell.
    #[error("corrupt cell: {0}")]
    CorruptCell(String),

    /// Wrapped backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Wrapped backend timeout.
    #[error("backend timeout: {0}")]
    BackendTimeout(String),

    /// Engine pool saturation.
    #[error("engine pool exhausted at {0} workers")]
    TooManyWorkers(usize),

    /// Bad configuration file or config value.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CdbError {
    fn from(e: rusqlite::Error) -> Self {
        CdbError::Backend(format!("sqlite: {e}"))
    }
}

impl From<clickhouse::error::Error> for CdbError {
    fn from(e: clickhouse::error::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("timed out") || msg.contains("timeout") {
            CdbError::BackendTimeout(format!("clickhouse: {msg}"))
        } else {
            CdbError::Backend(format!("clickhouse: {msg}"))
        }
    }
}

impl From<rmp_serde::decode::Error> for CdbError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CdbError::CorruptCell(format!("msgpack decode: {e}"))
    }
}

impl From<rmp_serde::encode::Error> for CdbError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CdbError::InvalidArgument(format!("msgpack encode: {e}"))
    }
}

impl From<toml::de::Error> for CdbError {
    fn from(e: toml::de::Error) -> Self {
        CdbError::Config(e.to_string())
    }
}
