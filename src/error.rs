use thiserror::Error;

/// Startup failures (no transport, no store) are fatal; the rest are local
/// and absorbed by the engine, logged with the triggering operation
/// aborted.
#[derive(Error, Debug)]
pub enum KapricaError {
    #[error("no Wayland display or data-control manager available")]
    TransportUnavailable,

    #[error("could not open or create the history store: {0}")]
    StoreUnavailable(#[source] rusqlite::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KapricaError>;
