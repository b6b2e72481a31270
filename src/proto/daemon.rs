//! CLI control protocol
//!
//! `bhidctl` talks to the daemon over the UNIX control socket with the same
//! length-prefixed framing as the tracker link. Tracker-bound operations
//! reuse the tracker payload shapes; the envelope adds the target tracker
//! name. Local operations (tokens, roster reads and updates) are answered
//! without leaving the host.

use super::tracker;
use super::MessageResult;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTokenRequest {
    #[prost(enumeration = "tracker::TokenKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    /// Daemon token to store and register with
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetConnectionsRequest {
    #[prost(message, optional, tag = "1")]
    pub list: Option<tracker::ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImportConnectionsRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(message, optional, tag = "2")]
    pub list: Option<tracker::ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateConnectionsRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub list: Option<tracker::ConnectionsList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(enumeration = "client_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    /// Target tracker; empty selects the first configured tracker
    #[prost(string, tag = "3")]
    pub tracker_name: String,
    #[prost(message, optional, tag = "4")]
    pub init_request: Option<tracker::InitRequest>,
    #[prost(message, optional, tag = "5")]
    pub confirm_request: Option<tracker::ConfirmRequest>,
    #[prost(message, optional, tag = "6")]
    pub create_daemon_request: Option<tracker::CreateDaemonRequest>,
    #[prost(message, optional, tag = "7")]
    pub delete_daemon_request: Option<tracker::DeleteDaemonRequest>,
    #[prost(message, optional, tag = "8")]
    pub auth_request: Option<AuthRequest>,
    #[prost(message, optional, tag = "9")]
    pub set_token_request: Option<SetTokenRequest>,
    #[prost(message, optional, tag = "10")]
    pub create_request: Option<tracker::CreateRequest>,
    #[prost(message, optional, tag = "11")]
    pub delete_request: Option<tracker::DeleteRequest>,
    #[prost(message, optional, tag = "12")]
    pub import_request: Option<tracker::ImportRequest>,
    #[prost(message, optional, tag = "13")]
    pub attach_request: Option<tracker::AttachRequest>,
    #[prost(message, optional, tag = "14")]
    pub detach_request: Option<tracker::DetachRequest>,
    #[prost(message, optional, tag = "15")]
    pub remote_attach_request: Option<tracker::RemoteAttachRequest>,
    #[prost(message, optional, tag = "16")]
    pub remote_detach_request: Option<tracker::RemoteDetachRequest>,
    #[prost(message, optional, tag = "17")]
    pub tree_request: Option<tracker::TreeRequest>,
    #[prost(message, optional, tag = "18")]
    pub connections_list_request: Option<tracker::ConnectionsListRequest>,
    #[prost(message, optional, tag = "19")]
    pub daemons_list_request: Option<tracker::DaemonsListRequest>,
    #[prost(message, optional, tag = "20")]
    pub set_connections_request: Option<SetConnectionsRequest>,
    #[prost(message, optional, tag = "21")]
    pub import_connections_request: Option<ImportConnectionsRequest>,
    #[prost(message, optional, tag = "22")]
    pub update_connections_request: Option<UpdateConnectionsRequest>,
    #[prost(message, optional, tag = "23")]
    pub redeem_master_request: Option<tracker::RedeemMasterRequest>,
    #[prost(message, optional, tag = "24")]
    pub redeem_daemon_request: Option<tracker::RedeemDaemonRequest>,
    #[prost(message, optional, tag = "25")]
    pub redeem_path_request: Option<tracker::RedeemPathRequest>,
}

pub mod client_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Install = 0,
        Init = 1,
        Confirm = 2,
        CreateDaemon = 3,
        DeleteDaemon = 4,
        /// Register with the tracker using the stored daemon token
        Register = 5,
        /// Store a daemon token, then register with it
        Auth = 6,
        SetToken = 7,
        Create = 8,
        Delete = 9,
        Import = 10,
        Attach = 11,
        Detach = 12,
        RemoteAttach = 13,
        RemoteDetach = 14,
        Tree = 15,
        ConnectionsList = 16,
        DaemonsList = 17,
        GetConnections = 18,
        SetConnections = 19,
        ImportConnections = 20,
        UpdateConnections = 21,
        RedeemMaster = 22,
        RedeemDaemon = 23,
        RedeemPath = 24,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(enumeration = "server_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    /// Overall outcome, also set for operations without a payload
    #[prost(enumeration = "MessageResult", tag = "3")]
    pub result: i32,
    #[prost(message, optional, tag = "4")]
    pub confirm_response: Option<tracker::ConfirmResponse>,
    #[prost(message, optional, tag = "5")]
    pub create_daemon_response: Option<tracker::CreateDaemonResponse>,
    #[prost(message, optional, tag = "6")]
    pub register_daemon_response: Option<tracker::RegisterDaemonResponse>,
    #[prost(message, optional, tag = "7")]
    pub create_response: Option<tracker::CreateResponse>,
    #[prost(message, optional, tag = "8")]
    pub import_response: Option<tracker::ImportResponse>,
    #[prost(message, optional, tag = "9")]
    pub attach_response: Option<tracker::AttachResponse>,
    #[prost(message, optional, tag = "10")]
    pub tree_response: Option<tracker::TreeResponse>,
    #[prost(message, optional, tag = "11")]
    pub connections_list_response: Option<tracker::ConnectionsListResponse>,
    #[prost(message, optional, tag = "12")]
    pub daemons_list_response: Option<tracker::DaemonsListResponse>,
    #[prost(message, optional, tag = "13")]
    pub get_connections_response: Option<tracker::GetConnectionsResponse>,
    #[prost(message, optional, tag = "14")]
    pub redeem_daemon_response: Option<tracker::RedeemDaemonResponse>,
    #[prost(message, optional, tag = "15")]
    pub redeem_path_response: Option<tracker::RedeemPathResponse>,
}

pub mod server_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        InstallResponse = 0,
        InitResponse = 1,
        ConfirmResponse = 2,
        CreateDaemonResponse = 3,
        DeleteDaemonResponse = 4,
        RegisterResponse = 5,
        AuthResponse = 6,
        SetTokenResponse = 7,
        CreateResponse = 8,
        DeleteResponse = 9,
        ImportResponse = 10,
        AttachResponse = 11,
        DetachResponse = 12,
        RemoteAttachResponse = 13,
        RemoteDetachResponse = 14,
        TreeResponse = 15,
        ConnectionsListResponse = 16,
        DaemonsListResponse = 17,
        GetConnectionsResponse = 18,
        SetConnectionsResponse = 19,
        ImportConnectionsResponse = 20,
        UpdateConnectionsResponse = 21,
        RedeemMasterResponse = 22,
        RedeemDaemonResponse = 23,
        RedeemPathResponse = 24,
    }
}

impl ServerMessage {
    /// Bare outcome reply
    pub fn with_result(r#type: server_message::Type, id: String, result: MessageResult) -> Self {
        ServerMessage {
            r#type: r#type as i32,
            id,
            result: result as i32,
            ..Default::default()
        }
    }
}
