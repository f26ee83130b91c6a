use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown user {0}")]
    UnknownUser(String),
}

/// Reasons an inbound event is dropped. None of these close the connection.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("chat message has an empty body")]
    EmptyMessage,
    #[error("event has no receiver")]
    MissingReceiver,
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}
