use serde::Serialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KrpcMessage {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,

    #[serde(rename = "y")]
    pub message_type: &'static str,

    #[serde(rename = "q", skip_serializing_if = "Option::is_none")]
    pub method: Option<&'static str>,

    #[serde(rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<KrpcRequestArguments>,

    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<KrpcResponseValues>,

    #[serde(rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<Value>>,

    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,
}

impl KrpcMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KrpcRequestArguments {
    pub id: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KrpcResponseValues {
    pub id: ByteBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
}
