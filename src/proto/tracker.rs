//! Tracker wire protocol
//!
//! The daemon exchanges `ClientMessage`/`ServerMessage` frames with each
//! configured tracker over plain TCP. Every request carries a UUID
//! `message_id`; the matching response echoes it. `AddressResponse` is the
//! one client message that travels over UDP instead, so the tracker can
//! observe the daemon's NAT mapping.

use super::MessageResult;

/// Connection role selector used by create/redeem requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionKind {
    Server = 0,
    Client = 1,
    NotConnected = 2,
}

/// Token kind for set-token style requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TokenKind {
    Master = 0,
    Daemon = 1,
}

/// A host/port endpoint exchanged during hole punching
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Endpoint {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

/// Server side of a connection as the tracker sees it
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerConnection {
    /// Full name, `tracker#email/path`
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub connect_address: String,
    #[prost(uint32, tag = "3")]
    pub connect_port: u32,
    #[prost(bool, tag = "4")]
    pub encrypted: bool,
    #[prost(bool, tag = "5")]
    pub fixed: bool,
    /// Daemons allowed to attach when fixed
    #[prost(string, repeated, tag = "6")]
    pub clients: Vec<String>,
    /// Live session count reported by the serving daemon
    #[prost(uint32, tag = "7")]
    pub connected: u32,
}

/// Client side of a connection as the tracker sees it
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientConnection {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub listen_address: String,
    #[prost(uint32, tag = "3")]
    pub listen_port: u32,
    #[prost(bool, tag = "4")]
    pub encrypted: bool,
    #[prost(bool, tag = "5")]
    pub fixed: bool,
    /// Daemon currently serving this connection
    #[prost(string, tag = "6")]
    pub server: String,
    #[prost(uint32, tag = "7")]
    pub connected: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionsList {
    #[prost(message, repeated, tag = "1")]
    pub server_connections: Vec<ServerConnection>,
    #[prost(message, repeated, tag = "2")]
    pub client_connections: Vec<ClientConnection>,
}

/// One node of a path tree answer
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tree {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bool, tag = "3")]
    pub connection: bool,
    #[prost(uint32, tag = "4")]
    pub servers_number: u32,
    #[prost(uint32, tag = "5")]
    pub clients_number: u32,
    #[prost(message, repeated, tag = "6")]
    pub tree: Vec<Tree>,
}

/// One daemon of a daemons-list answer
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DaemonInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub online: bool,
    #[prost(bool, tag = "3")]
    pub server: bool,
    #[prost(bool, tag = "4")]
    pub client: bool,
    #[prost(string, tag = "5")]
    pub version: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequest {
    #[prost(string, tag = "1")]
    pub email: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfirmRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateDaemonRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub daemon_name: String,
    #[prost(bool, tag = "3")]
    pub random_name: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteDaemonRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub daemon_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDaemonRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    /// RSA identity fingerprint
    #[prost(string, tag = "2")]
    pub identity: String,
    /// base64 public key PEM
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(string, tag = "4")]
    pub version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub connect_address: String,
    #[prost(uint32, tag = "4")]
    pub connect_port: u32,
    #[prost(string, tag = "5")]
    pub listen_address: String,
    #[prost(uint32, tag = "6")]
    pub listen_port: u32,
    #[prost(bool, tag = "7")]
    pub encrypted: bool,
    #[prost(bool, tag = "8")]
    pub fixed: bool,
    /// Role this daemon takes on the new connection
    #[prost(enumeration = "ConnectionKind", tag = "9")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImportRequest {
    /// Server or client connection token
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub address_override: String,
    #[prost(uint32, tag = "4")]
    pub port_override: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DetachRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteAttachRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub daemon_name: String,
    #[prost(bool, tag = "4")]
    pub server: bool,
    #[prost(string, tag = "5")]
    pub address_override: String,
    #[prost(uint32, tag = "6")]
    pub port_override: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteDetachRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, tag = "3")]
    pub daemon_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionsListRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DaemonsListRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetConnectionsRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTokenRequest {
    #[prost(enumeration = "TokenKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub token: String,
}

/// One-way session count report, no response
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(string, tag = "1")]
    pub connection_name: String,
    #[prost(uint32, tag = "2")]
    pub sessions: u32,
}

/// Sent over UDP directly to the tracker's address (§4.5)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddressResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupIdentityRequest {
    #[prost(string, tag = "1")]
    pub identity: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemMasterRequest {
    #[prost(string, tag = "1")]
    pub email: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemDaemonRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub daemon_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemPathRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(enumeration = "ConnectionKind", tag = "3")]
    pub kind: i32,
}

// ---------------------------------------------------------------------------
// Responses and server-originated messages
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfirmResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    /// Master token on success
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateDaemonResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(string, tag = "2")]
    pub daemon_name: String,
    /// Daemon token on success
    #[prost(string, tag = "3")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteDaemonResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDaemonResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(string, tag = "2")]
    pub server_token: String,
    #[prost(string, tag = "3")]
    pub client_token: String,
    #[prost(message, optional, tag = "4")]
    pub updates: Option<ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImportResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub updates: Option<ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub updates: Option<ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DetachResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteAttachResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteDetachResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub tree: Option<Tree>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionsListResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub list: Option<ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DaemonsListResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, repeated, tag = "2")]
    pub list: Vec<DaemonInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetConnectionsResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub active: Option<ConnectionsList>,
    #[prost(message, optional, tag = "3")]
    pub imported: Option<ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTokenResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupIdentityResponse {
    #[prost(enumeration = "lookup_identity_response::Response", tag = "1")]
    pub response: i32,
    /// Daemon full name, `email?daemon`
    #[prost(string, tag = "2")]
    pub name: String,
    /// base64 public key PEM
    #[prost(string, tag = "3")]
    pub key: String,
}

pub mod lookup_identity_response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Response {
        Found = 0,
        NotFound = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemMasterResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemDaemonResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RedeemPathResponse {
    #[prost(enumeration = "MessageResult", tag = "1")]
    pub response: i32,
    #[prost(string, tag = "2")]
    pub token: String,
}

/// Tracker asks the daemon to reveal its NAT-mapped endpoint
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddressRequest {
    #[prost(string, tag = "1")]
    pub connection_name: String,
    #[prost(string, tag = "2")]
    pub request_id: String,
}

/// Tracker instructs both sides of a connection to hole-punch each other
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PunchRequest {
    #[prost(string, tag = "1")]
    pub connection_name: String,
    /// Correlates with the address exchange that produced the endpoints
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(message, optional, tag = "3")]
    pub server: Option<Endpoint>,
    #[prost(message, optional, tag = "4")]
    pub client: Option<Endpoint>,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(enumeration = "client_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub message_id: String,
    #[prost(message, optional, tag = "3")]
    pub init_request: Option<InitRequest>,
    #[prost(message, optional, tag = "4")]
    pub confirm_request: Option<ConfirmRequest>,
    #[prost(message, optional, tag = "5")]
    pub create_daemon_request: Option<CreateDaemonRequest>,
    #[prost(message, optional, tag = "6")]
    pub delete_daemon_request: Option<DeleteDaemonRequest>,
    #[prost(message, optional, tag = "7")]
    pub register_daemon_request: Option<RegisterDaemonRequest>,
    #[prost(message, optional, tag = "8")]
    pub create_request: Option<CreateRequest>,
    #[prost(message, optional, tag = "9")]
    pub delete_request: Option<DeleteRequest>,
    #[prost(message, optional, tag = "10")]
    pub import_request: Option<ImportRequest>,
    #[prost(message, optional, tag = "11")]
    pub attach_request: Option<AttachRequest>,
    #[prost(message, optional, tag = "12")]
    pub detach_request: Option<DetachRequest>,
    #[prost(message, optional, tag = "13")]
    pub remote_attach_request: Option<RemoteAttachRequest>,
    #[prost(message, optional, tag = "14")]
    pub remote_detach_request: Option<RemoteDetachRequest>,
    #[prost(message, optional, tag = "15")]
    pub tree_request: Option<TreeRequest>,
    #[prost(message, optional, tag = "16")]
    pub connections_list_request: Option<ConnectionsListRequest>,
    #[prost(message, optional, tag = "17")]
    pub daemons_list_request: Option<DaemonsListRequest>,
    #[prost(message, optional, tag = "18")]
    pub get_connections_request: Option<GetConnectionsRequest>,
    #[prost(message, optional, tag = "19")]
    pub set_token_request: Option<SetTokenRequest>,
    #[prost(message, optional, tag = "20")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "21")]
    pub address_response: Option<AddressResponse>,
    #[prost(message, optional, tag = "22")]
    pub lookup_identity_request: Option<LookupIdentityRequest>,
    #[prost(message, optional, tag = "23")]
    pub redeem_master_request: Option<RedeemMasterRequest>,
    #[prost(message, optional, tag = "24")]
    pub redeem_daemon_request: Option<RedeemDaemonRequest>,
    #[prost(message, optional, tag = "25")]
    pub redeem_path_request: Option<RedeemPathRequest>,
}

pub mod client_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        InitRequest = 0,
        ConfirmRequest = 1,
        CreateDaemonRequest = 2,
        DeleteDaemonRequest = 3,
        RegisterDaemonRequest = 4,
        CreateRequest = 5,
        DeleteRequest = 6,
        ImportRequest = 7,
        AttachRequest = 8,
        DetachRequest = 9,
        RemoteAttachRequest = 10,
        RemoteDetachRequest = 11,
        TreeRequest = 12,
        ConnectionsListRequest = 13,
        DaemonsListRequest = 14,
        GetConnectionsRequest = 15,
        SetTokenRequest = 16,
        Status = 17,
        AddressResponse = 18,
        LookupIdentityRequest = 19,
        RedeemMasterRequest = 20,
        RedeemDaemonRequest = 21,
        RedeemPathRequest = 22,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(enumeration = "server_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub message_id: String,
    #[prost(message, optional, tag = "3")]
    pub init_response: Option<InitResponse>,
    #[prost(message, optional, tag = "4")]
    pub confirm_response: Option<ConfirmResponse>,
    #[prost(message, optional, tag = "5")]
    pub create_daemon_response: Option<CreateDaemonResponse>,
    #[prost(message, optional, tag = "6")]
    pub delete_daemon_response: Option<DeleteDaemonResponse>,
    #[prost(message, optional, tag = "7")]
    pub register_daemon_response: Option<RegisterDaemonResponse>,
    #[prost(message, optional, tag = "8")]
    pub create_response: Option<CreateResponse>,
    #[prost(message, optional, tag = "9")]
    pub delete_response: Option<DeleteResponse>,
    #[prost(message, optional, tag = "10")]
    pub import_response: Option<ImportResponse>,
    #[prost(message, optional, tag = "11")]
    pub attach_response: Option<AttachResponse>,
    #[prost(message, optional, tag = "12")]
    pub detach_response: Option<DetachResponse>,
    #[prost(message, optional, tag = "13")]
    pub remote_attach_response: Option<RemoteAttachResponse>,
    #[prost(message, optional, tag = "14")]
    pub remote_detach_response: Option<RemoteDetachResponse>,
    #[prost(message, optional, tag = "15")]
    pub tree_response: Option<TreeResponse>,
    #[prost(message, optional, tag = "16")]
    pub connections_list_response: Option<ConnectionsListResponse>,
    #[prost(message, optional, tag = "17")]
    pub daemons_list_response: Option<DaemonsListResponse>,
    #[prost(message, optional, tag = "18")]
    pub get_connections_response: Option<GetConnectionsResponse>,
    #[prost(message, optional, tag = "19")]
    pub set_token_response: Option<SetTokenResponse>,
    #[prost(message, optional, tag = "20")]
    pub lookup_identity_response: Option<LookupIdentityResponse>,
    #[prost(message, optional, tag = "21")]
    pub redeem_master_response: Option<RedeemMasterResponse>,
    #[prost(message, optional, tag = "22")]
    pub redeem_daemon_response: Option<RedeemDaemonResponse>,
    #[prost(message, optional, tag = "23")]
    pub redeem_path_response: Option<RedeemPathResponse>,
    #[prost(message, optional, tag = "24")]
    pub connections_list: Option<ConnectionsList>,
    #[prost(message, optional, tag = "25")]
    pub address_request: Option<AddressRequest>,
    #[prost(message, optional, tag = "26")]
    pub punch_request: Option<PunchRequest>,
}

pub mod server_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        InitResponse = 0,
        ConfirmResponse = 1,
        CreateDaemonResponse = 2,
        DeleteDaemonResponse = 3,
        RegisterDaemonResponse = 4,
        CreateResponse = 5,
        DeleteResponse = 6,
        ImportResponse = 7,
        AttachResponse = 8,
        DetachResponse = 9,
        RemoteAttachResponse = 10,
        RemoteDetachResponse = 11,
        TreeResponse = 12,
        ConnectionsListResponse = 13,
        DaemonsListResponse = 14,
        GetConnectionsResponse = 15,
        SetTokenResponse = 16,
        LookupIdentityResponse = 17,
        RedeemMasterResponse = 18,
        RedeemDaemonResponse = 19,
        RedeemPathResponse = 20,
        ConnectionsList = 21,
        AddressRequest = 22,
        PunchRequest = 23,
    }
}

impl ClientMessage {
    /// Envelope with a fresh message id and every payload slot empty
    pub fn new(r#type: client_message::Type, message_id: String) -> Self {
        ClientMessage {
            r#type: r#type as i32,
            message_id,
            ..Default::default()
        }
    }
}
