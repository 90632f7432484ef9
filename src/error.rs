//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Krpc crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to encode or decode bencode: {0}")]
    /// Errors related to encoding DHT messages.
    BencodeError(#[from] serde_bencode::Error),

    /// Id is not exactly [crate::common::ID_SIZE] bytes long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that the message transaction_id is not four bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// Requests and responses can't be encoded without the sender id.
    #[error("Message has no sender id")]
    MissingSenderId,

    /// The server was stopped, or never started, and has no socket.
    #[error("Rpc server is not running")]
    NotRunning,
}
