//! Peer-to-peer wire messages
//!
//! Two layers ride on a UTP session: `OuterMessage` frames carry the
//! handshake and the (optionally encrypted) payload envelope, and
//! `InnerMessage` frames inside the envelope carry the channel protocol.

/// Handshake sent by each side after the UTP connection opens
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    /// Full connection name, `tracker#email/path`
    #[prost(string, tag = "1")]
    pub connection_name: String,
    /// Sender's RSA identity fingerprint
    #[prost(string, tag = "2")]
    pub identity: String,
    /// base64 of the sender's session public key
    #[prost(string, tag = "3")]
    pub public_key: String,
    /// base64 RSA signature over the session public key
    #[prost(string, tag = "4")]
    pub signature: String,
    /// Whether payload envelopes on this session are encrypted
    #[prost(bool, tag = "5")]
    pub encrypted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    #[prost(enumeration = "connect_response::Response", tag = "1")]
    pub response: i32,
}

pub mod connect_response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Response {
        Accepted = 0,
        Rejected = 1,
    }
}

/// Encrypted payload envelope: a boxed `InnerMessage` frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Plaintext payload envelope
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlainMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

/// Top-level session frame
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OuterMessage {
    #[prost(enumeration = "outer_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub connect_request: Option<ConnectRequest>,
    #[prost(message, optional, tag = "3")]
    pub connect_response: Option<ConnectResponse>,
    #[prost(message, optional, tag = "4")]
    pub encrypted_message: Option<EncryptedMessage>,
    #[prost(message, optional, tag = "5")]
    pub message: Option<PlainMessage>,
}

pub mod outer_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        ConnectRequest = 0,
        ConnectResponse = 1,
        EncryptedMessage = 2,
        Message = 3,
        Bye = 4,
    }
}

/// Channel-level protocol carried inside payload envelopes
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InnerMessage {
    #[prost(enumeration = "inner_message::Type", tag = "1")]
    pub r#type: i32,
    /// Channel UUID allocated by the originator
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

pub mod inner_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Open = 0,
        Data = 1,
        Close = 2,
    }
}

impl OuterMessage {
    pub fn bye() -> Self {
        OuterMessage {
            r#type: outer_message::Type::Bye as i32,
            ..Default::default()
        }
    }

    pub fn connect_request(req: ConnectRequest) -> Self {
        OuterMessage {
            r#type: outer_message::Type::ConnectRequest as i32,
            connect_request: Some(req),
            ..Default::default()
        }
    }

    pub fn connect_response(accepted: bool) -> Self {
        let response = if accepted {
            connect_response::Response::Accepted
        } else {
            connect_response::Response::Rejected
        };
        OuterMessage {
            r#type: outer_message::Type::ConnectResponse as i32,
            connect_response: Some(ConnectResponse {
                response: response as i32,
            }),
            ..Default::default()
        }
    }

    pub fn plain(payload: Vec<u8>) -> Self {
        OuterMessage {
            r#type: outer_message::Type::Message as i32,
            message: Some(PlainMessage { payload }),
            ..Default::default()
        }
    }

    pub fn encrypted(nonce: Vec<u8>, payload: Vec<u8>) -> Self {
        OuterMessage {
            r#type: outer_message::Type::EncryptedMessage as i32,
            encrypted_message: Some(EncryptedMessage { nonce, payload }),
            ..Default::default()
        }
    }
}

impl InnerMessage {
    pub fn open(id: String) -> Self {
        InnerMessage {
            r#type: inner_message::Type::Open as i32,
            id,
            data: Vec::new(),
        }
    }

    pub fn data(id: String, data: Vec<u8>) -> Self {
        InnerMessage {
            r#type: inner_message::Type::Data as i32,
            id,
            data,
        }
    }

    pub fn close(id: String) -> Self {
        InnerMessage {
            r#type: inner_message::Type::Close as i32,
            id,
            data: Vec::new(),
        }
    }
}
