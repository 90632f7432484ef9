//! Decode, parse and encode Krpc messages.
//!
//! Decoding and parsing are two separate steps, so that a reply to a message
//! with a valid encoding but an invalid structure can still carry the
//! transaction id the sender used.

mod internal;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::common::{bytes_to_nodes4, nodes4_to_bytes, Id, Node, TransactionId};
use crate::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Raw transaction id, echoed verbatim in responses and errors.
    ///
    /// Transactions initiated by this crate always use 4 bytes, see [TransactionId].
    pub transaction_id: Bytes,

    /// The version of the requester or responder.
    pub version: Option<Bytes>,

    /// Id of the node sending this message, carried in the `a` or `r` dictionary.
    ///
    /// Unused for [MessageType::Error].
    pub sender_id: Option<Id>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct ResponseSpecific {
    pub nodes: Option<Vec<Node>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Krpc error codes.
pub enum ErrorCode {
    Generic = 201,
    Server = 202,
    Protocol = 203,
    MethodUnknown = 204,
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        *self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Coarse message classification used by the statistics counters.
pub enum MessageKind {
    Ping,
    FindNode,
    Response,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::Ping,
        MessageKind::FindNode,
        MessageKind::Response,
        MessageKind::Error,
    ];

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(thiserror::Error, Debug)]
/// The bytes of a datagram are not a bencoded dictionary.
pub enum DecodeError {
    #[error("invalid bencoding: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid bencoding: top level value is not a dictionary")]
    NotADictionary,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{description}")]
/// A valid bencoded dictionary that is not a valid Krpc message.
pub struct ParseError {
    pub code: ErrorCode,
    pub description: String,
    /// The raw `t` value, if it could be recovered.
    pub transaction_id: Option<Bytes>,
}

/// Decode the wire encoding of a datagram into a bencoded dictionary.
pub fn decode(bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
    match serde_bencode::from_bytes::<Value>(bytes)? {
        value @ Value::Dict(_) => Ok(value),
        _ => Err(DecodeError::NotADictionary),
    }
}

impl Message {
    pub fn request(sender_id: Option<Id>, request: RequestSpecific) -> Message {
        Message {
            transaction_id: Bytes::new(),
            version: None,
            sender_id,
            message_type: MessageType::Request(request),
        }
    }

    pub fn response(transaction_id: Bytes, response: ResponseSpecific) -> Message {
        Message {
            transaction_id,
            version: None,
            sender_id: None,
            message_type: MessageType::Response(response),
        }
    }

    pub fn error(transaction_id: Bytes, code: ErrorCode, description: impl Into<String>) -> Message {
        Message {
            transaction_id,
            version: None,
            sender_id: None,
            message_type: MessageType::Error(ErrorSpecific {
                code: code.code(),
                description: description.into(),
            }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.message_type {
            MessageType::Request(RequestSpecific::Ping) => MessageKind::Ping,
            MessageType::Request(RequestSpecific::FindNode(_)) => MessageKind::FindNode,
            MessageType::Response(_) => MessageKind::Response,
            MessageType::Error(_) => MessageKind::Error,
        }
    }

    /// Responses and errors are the only messages that can complete a call.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::Response(_) | MessageType::Error(_)
        )
    }

    /// Returns the transaction id if it has the shape of one issued by this crate.
    pub fn tid(&self) -> Option<TransactionId> {
        TransactionId::from_bytes(&self.transaction_id).ok()
    }

    /// Parse a decoded dictionary, see [decode], into a typed message.
    pub fn parse(value: &Value) -> std::result::Result<Message, ParseError> {
        let dict = match value {
            Value::Dict(dict) => dict,
            _ => return Err(ParseError::protocol("message is not a dictionary", None)),
        };

        let transaction_id = match get(dict, "t") {
            Some(Value::Bytes(t)) => Bytes::copy_from_slice(t),
            _ => {
                return Err(ParseError::protocol(
                    "missing or invalid transaction id",
                    None,
                ))
            }
        };

        let protocol_error =
            |description: &str| ParseError::protocol(description, Some(transaction_id.clone()));

        let version = match get(dict, "v") {
            Some(Value::Bytes(v)) => Some(Bytes::copy_from_slice(v)),
            _ => None,
        };

        let message_type = get_bytes(dict, "y").ok_or_else(|| protocol_error("missing message type"))?;

        let (sender_id, message_type) = match message_type {
            b"q" => {
                let method =
                    get_bytes(dict, "q").ok_or_else(|| protocol_error("missing method name"))?;
                let arguments =
                    get_dict(dict, "a").ok_or_else(|| protocol_error("missing arguments"))?;
                let sender_id =
                    get_id(arguments, "id").ok_or_else(|| protocol_error("missing or invalid id"))?;

                let request = match method {
                    b"ping" => RequestSpecific::Ping,
                    b"find_node" => RequestSpecific::FindNode(FindNodeRequestArguments {
                        target: get_id(arguments, "target")
                            .ok_or_else(|| protocol_error("missing or invalid target"))?,
                    }),
                    other => {
                        return Err(ParseError {
                            code: ErrorCode::MethodUnknown,
                            description: format!(
                                "method unknown: {}",
                                String::from_utf8_lossy(other)
                            ),
                            transaction_id: Some(transaction_id.clone()),
                        })
                    }
                };

                (Some(sender_id), MessageType::Request(request))
            }
            b"r" => {
                let values =
                    get_dict(dict, "r").ok_or_else(|| protocol_error("missing response values"))?;
                let sender_id =
                    get_id(values, "id").ok_or_else(|| protocol_error("missing or invalid id"))?;

                let nodes = match get(values, "nodes") {
                    Some(Value::Bytes(nodes)) => Some(
                        bytes_to_nodes4(nodes)
                            .ok_or_else(|| protocol_error("invalid compact nodes"))?,
                    ),
                    Some(_) => return Err(protocol_error("invalid compact nodes")),
                    None => None,
                };

                (Some(sender_id), MessageType::Response(ResponseSpecific { nodes }))
            }
            b"e" => {
                let error = match get(dict, "e") {
                    Some(Value::List(list)) => match list.as_slice() {
                        [Value::Int(code), Value::Bytes(description), ..] => ErrorSpecific {
                            code: *code,
                            description: String::from_utf8_lossy(description).into_owned(),
                        },
                        [Value::Int(code)] => ErrorSpecific {
                            code: *code,
                            description: String::new(),
                        },
                        _ => return Err(protocol_error("invalid error list")),
                    },
                    _ => return Err(protocol_error("missing error list")),
                };

                (None, MessageType::Error(error))
            }
            _ => return Err(protocol_error("unknown message type")),
        };

        Ok(Message {
            transaction_id,
            version,
            sender_id,
            message_type,
        })
    }

    /// Decode and parse in one step, for callers that don't need to reply to failures.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let value = decode(bytes).map_err(|error| match error {
            DecodeError::Bencode(error) => Error::BencodeError(error),
            DecodeError::NotADictionary => Error::BencodeError(
                serde_bencode::Error::InvalidType("expected a dictionary".to_string()),
            ),
        })?;

        Message::parse(&value).map_err(|error| {
            Error::BencodeError(serde_bencode::Error::Custom(error.description))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_serde_message()?.to_bytes()?)
    }

    fn to_serde_message(&self) -> Result<internal::KrpcMessage> {
        let sender_id = || {
            self.sender_id
                .map(|id| ByteBuf::from(id.as_bytes().to_vec()))
                .ok_or(Error::MissingSenderId)
        };

        let mut message = internal::KrpcMessage {
            transaction_id: ByteBuf::from(self.transaction_id.to_vec()),
            message_type: "q",
            method: None,
            arguments: None,
            response: None,
            error: None,
            version: self.version.as_ref().map(|v| ByteBuf::from(v.to_vec())),
        };

        match &self.message_type {
            MessageType::Request(request) => {
                let (method, target) = match request {
                    RequestSpecific::Ping => ("ping", None),
                    RequestSpecific::FindNode(args) => {
                        ("find_node", Some(ByteBuf::from(args.target.as_bytes().to_vec())))
                    }
                };

                message.method = Some(method);
                message.arguments = Some(internal::KrpcRequestArguments {
                    id: sender_id()?,
                    target,
                });
            }
            MessageType::Response(response) => {
                message.message_type = "r";
                message.response = Some(internal::KrpcResponseValues {
                    id: sender_id()?,
                    nodes: response
                        .nodes
                        .as_ref()
                        .map(|nodes| ByteBuf::from(nodes4_to_bytes(nodes))),
                });
            }
            MessageType::Error(error) => {
                message.message_type = "e";
                message.error = Some(vec![
                    Value::Int(error.code),
                    Value::Bytes(error.description.clone().into_bytes()),
                ]);
            }
        }

        Ok(message)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let tid = self.transaction_id.as_ref();
        match &self.message_type {
            MessageType::Request(RequestSpecific::Ping) => write!(f, "ping {tid:02x?}"),
            MessageType::Request(RequestSpecific::FindNode(args)) => {
                write!(f, "find_node {tid:02x?} target: {}", args.target)
            }
            MessageType::Response(response) => write!(
                f,
                "response {tid:02x?} nodes: {}",
                response.nodes.as_ref().map(|n| n.len()).unwrap_or(0)
            ),
            MessageType::Error(error) => {
                write!(f, "error {tid:02x?} {} {}", error.code, error.description)
            }
        }
    }
}

impl ParseError {
    fn protocol(description: &str, transaction_id: Option<Bytes>) -> Self {
        ParseError {
            code: ErrorCode::Protocol,
            description: description.to_string(),
            transaction_id,
        }
    }
}

fn get<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &str) -> Option<&'a Value> {
    dict.get(key.as_bytes())
}

fn get_bytes<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &str) -> Option<&'a [u8]> {
    match get(dict, key) {
        Some(Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

fn get_dict<'a>(
    dict: &'a HashMap<Vec<u8>, Value>,
    key: &str,
) -> Option<&'a HashMap<Vec<u8>, Value>> {
    match get(dict, key) {
        Some(Value::Dict(dict)) => Some(dict),
        _ => None,
    }
}

fn get_id(dict: &HashMap<Vec<u8>, Value>, key: &str) -> Option<Id> {
    get_bytes(dict, key).and_then(|bytes| Id::from_bytes(bytes).ok())
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn tid() -> Bytes {
        Bytes::from_static(&[1, 2, 3, 4])
    }

    #[test]
    fn ping_request() {
        let id = Id::random();
        let mut message = Message::request(Some(id), RequestSpecific::Ping);
        message.transaction_id = tid();
        message.version = Some(Bytes::from_static(b"RS05"));

        let bytes = message.to_bytes().unwrap();
        let parsed = Message::parse(&decode(&bytes).unwrap()).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(parsed.kind(), MessageKind::Ping);
        assert_eq!(parsed.tid(), Some(TransactionId([1, 2, 3, 4])));
    }

    #[test]
    fn find_node_response_with_nodes() {
        let node = Node::new(Id::random(), SocketAddrV4::new([1, 2, 3, 4].into(), 6881));
        let mut message = Message::response(
            tid(),
            ResponseSpecific {
                nodes: Some(vec![node]),
            },
        );
        message.sender_id = Some(Id::random());

        let parsed = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
        assert!(parsed.is_reply());
    }

    #[test]
    fn error_message() {
        let message = Message::error(tid(), ErrorCode::Protocol, "invalid bencoding");
        let parsed = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(parsed.kind(), MessageKind::Error);
    }

    #[test]
    fn request_without_sender_id_cannot_be_encoded() {
        let message = Message::request(None, RequestSpecific::Ping);

        assert!(matches!(message.to_bytes(), Err(Error::MissingSenderId)));
    }

    #[test]
    fn decode_invalid_bencode() {
        assert!(matches!(
            decode(b"d1:t4:ab"),
            Err(DecodeError::Bencode(_))
        ));
        assert!(matches!(decode(b"i42e"), Err(DecodeError::NotADictionary)));
    }

    #[test]
    fn parse_missing_transaction_id() {
        let value = decode(b"d1:y1:qe").unwrap();
        let error = Message::parse(&value).unwrap_err();

        assert_eq!(error.code, ErrorCode::Protocol);
        assert_eq!(error.transaction_id, None);
    }

    #[test]
    fn parse_unknown_method_keeps_transaction_id() {
        let value = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q4:wave1:t2:aa1:y1:qe").unwrap();
        let error = Message::parse(&value).unwrap_err();

        assert_eq!(error.code, ErrorCode::MethodUnknown);
        assert_eq!(error.transaction_id, Some(Bytes::from_static(b"aa")));
    }

    #[test]
    fn parse_foreign_transaction_id() {
        let value = decode(b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe").unwrap();
        let message = Message::parse(&value).unwrap();

        assert_eq!(message.transaction_id, Bytes::from_static(b"aa"));
        assert_eq!(message.tid(), None);
        assert_eq!(
            message.sender_id,
            Some(Id::from_bytes(b"abcdefghij0123456789").unwrap())
        );
    }
}
