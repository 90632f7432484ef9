#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod error;
pub mod rpc;

pub use crate::common::{
    decode, DecodeError, ErrorCode, ErrorSpecific, FindNodeRequestArguments, Id, Message,
    MessageKind, MessageType, Node, ParseError, RequestSpecific, ResponseSpecific, TransactionId,
};
pub use bytes::Bytes;
pub use error::Error;
pub use rpc::{Config, RpcCall, RpcServer, ServerContext};

/// Alias `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
