use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),

    #[error("key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),

    #[error("event build error: {0}")]
    EventBuilder(#[from] nostr_sdk::event::builder::Error),

    #[error("encryption error: {0}")]
    Encryption(#[from] nostr_sdk::nips::nip04::Error),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("no healthy relay connection")]
    NoHealthyRelay,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
