//! Control server
//!
//! Serves the `bhidctl` CLI over a 0600 UNIX socket in the runtime
//! directory. Each client runs a framed request/reply loop: tracker-bound
//! operations are correlated through Tracker waiters with the standard
//! 60-second bound, local operations (tokens, roster reads and updates)
//! answer without leaving the host.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

use crate::proto::daemon::{client_message, server_message, ClientMessage, ServerMessage};
use crate::proto::tracker as tp;
use crate::proto::{read_frame, write_frame, MessageResult};
use crate::registry::Registry;
use crate::tracker::Tokens;

/// Socket mode: owner only
const SOCKET_MODE: u32 = 0o600;

pub struct ControlServer {
    registry: Arc<Registry>,
    tokens: Tokens,
}

impl ControlServer {
    /// Bind the control socket and serve clients until the process exits
    pub fn start(
        registry: Arc<Registry>,
        tokens: Tokens,
        socket_path: PathBuf,
    ) -> std::io::Result<()> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        tracing::info!(target: "control", "listening on {}", socket_path.display());

        let server = Arc::new(ControlServer { registry, tokens });
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.client_loop(stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "control", "accept failed: {}", e);
                    }
                }
            }
        });
        Ok(())
    }

    async fn client_loop(self: Arc<Self>, mut stream: UnixStream) {
        loop {
            let request: ClientMessage = match read_frame(&mut stream).await {
                Ok(Ok(request)) => request,
                Ok(Err(e)) => {
                    tracing::warn!(target: "control", "bad request frame: {}", e);
                    return;
                }
                Err(_) => return,
            };

            let reply = self.dispatch(request).await;
            if write_frame(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }

    /// Pick the target tracker: explicit name or the first configured one
    fn tracker_name(&self, requested: &str) -> Option<String> {
        if !requested.is_empty() {
            return Some(requested.to_string());
        }
        self.registry
            .config()
            .trackers
            .first()
            .map(|t| t.name.clone())
    }

    /// Fill an empty token with the stored daemon token, then master token
    fn fill_token(&self, tracker: &str, token: String) -> String {
        if !token.is_empty() {
            return token;
        }
        self.tokens
            .daemon_token(tracker)
            .or_else(|| self.tokens.master_token(tracker))
            .unwrap_or_default()
    }

    async fn roundtrip(
        &self,
        tracker: &str,
        message: tp::ClientMessage,
    ) -> Result<tp::ServerMessage, MessageResult> {
        self.registry
            .tracker()
            .request(tracker, message)
            .await
            .map_err(MessageResult::from)
    }

    fn outbound(ty: tp::client_message::Type) -> tp::ClientMessage {
        tp::ClientMessage::new(ty, Uuid::new_v4().to_string())
    }

    async fn dispatch(&self, request: ClientMessage) -> ServerMessage {
        use client_message::Type as Req;
        use server_message::Type as Resp;

        let id = request.id.clone();
        let ty = match Req::try_from(request.r#type) {
            Ok(ty) => ty,
            Err(_) => {
                tracing::warn!(target: "control", "unknown request type {}", request.r#type);
                return ServerMessage::with_result(
                    Resp::InstallResponse,
                    id,
                    MessageResult::Rejected,
                );
            }
        };

        let Some(tracker) = self.tracker_name(&request.tracker_name) else {
            return ServerMessage::with_result(resp_type(ty), id, MessageResult::NoTracker);
        };

        match ty {
            Req::Install => self.handle_install(id),
            Req::SetToken => self.handle_set_token(&tracker, id, request).await,
            Req::Register => self.handle_register(&tracker, id).await,
            Req::Auth => self.handle_auth(&tracker, id, request).await,
            Req::GetConnections => self.handle_get_connections(&tracker, id),
            Req::SetConnections => self.handle_set_connections(&tracker, id, request).await,
            Req::ImportConnections => self.handle_import_connections(&tracker, id, request),
            Req::UpdateConnections => self.handle_update_connections(&tracker, id, request).await,
            _ => self.forward(&tracker, ty, id, request).await,
        }
    }

    /// Ensure the on-disk layout exists with the expected modes
    fn handle_install(&self, id: String) -> ServerMessage {
        let config = self.registry.config();
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&config.config_dir)?;
            std::fs::create_dir_all(config.id_dir())?;
            std::fs::create_dir_all(config.peers_dir())?;
            std::fs::create_dir_all(config.config_dir.join("certs"))?;
            std::fs::create_dir_all(config.master_dir())?;
            std::fs::set_permissions(
                config.master_dir(),
                std::fs::Permissions::from_mode(0o700),
            )?;
            std::fs::create_dir_all(&config.runtime_dir)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                ServerMessage::with_result(server_message::Type::InstallResponse, id, MessageResult::Accepted)
            }
            Err(e) => {
                tracing::warn!(target: "control", "install failed: {}", e);
                ServerMessage::with_result(server_message::Type::InstallResponse, id, MessageResult::Rejected)
            }
        }
    }

    async fn handle_set_token(
        &self,
        tracker: &str,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        let resp = server_message::Type::SetTokenResponse;
        let Some(payload) = request.set_token_request else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let stored = match tp::TokenKind::try_from(payload.kind) {
            Ok(tp::TokenKind::Master) => self.tokens.set_master_token(tracker, &payload.token),
            Ok(tp::TokenKind::Daemon) => {
                let result = self.tokens.set_daemon_token(tracker, &payload.token);
                if result.is_ok() {
                    self.registry.tracker().reregister(tracker).await;
                }
                result
            }
            Err(_) => {
                return ServerMessage::with_result(resp, id, MessageResult::Rejected);
            }
        };
        match stored {
            Ok(()) => ServerMessage::with_result(resp, id, MessageResult::Accepted),
            Err(e) => {
                tracing::warn!(target: "control", "set-token failed: {}", e);
                ServerMessage::with_result(resp, id, MessageResult::Rejected)
            }
        }
    }

    /// Register with the tracker using the already-stored daemon token
    async fn handle_register(&self, tracker: &str, id: String) -> ServerMessage {
        let resp = server_message::Type::RegisterResponse;
        if self.tokens.daemon_token(tracker).is_none() {
            return ServerMessage::with_result(resp, id, MessageResult::NotRegistered);
        }
        let handle = self.registry.tracker();
        if !handle.is_connected(tracker) {
            return ServerMessage::with_result(resp, id, MessageResult::NoTracker);
        }
        handle.reregister(tracker).await;
        self.registration_reply(tracker, resp, id)
    }

    /// Store the daemon token and register right away
    async fn handle_auth(
        &self,
        tracker: &str,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        let resp = server_message::Type::AuthResponse;
        let Some(payload) = request.auth_request else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        if self.tokens.set_daemon_token(tracker, &payload.token).is_err() {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        }
        let handle = self.registry.tracker();
        if !handle.is_connected(tracker) {
            return ServerMessage::with_result(resp, id, MessageResult::NoTracker);
        }
        handle.reregister(tracker).await;
        self.registration_reply(tracker, resp, id)
    }

    /// Reply with the registration outcome, carrying the registered email
    /// and daemon name when the tracker accepted us
    fn registration_reply(
        &self,
        tracker: &str,
        resp: server_message::Type,
        id: String,
    ) -> ServerMessage {
        match self.registry.tracker().registration(tracker) {
            Some((email, name)) => {
                let mut out = ServerMessage::with_result(resp, id, MessageResult::Accepted);
                out.register_daemon_response = Some(tp::RegisterDaemonResponse {
                    response: MessageResult::Accepted as i32,
                    email,
                    name,
                });
                out
            }
            None => ServerMessage::with_result(resp, id, MessageResult::Rejected),
        }
    }

    fn handle_get_connections(&self, tracker: &str, id: String) -> ServerMessage {
        let connections = self.registry.connections();
        let mut reply = ServerMessage::with_result(
            server_message::Type::GetConnectionsResponse,
            id,
            MessageResult::Accepted,
        );
        reply.get_connections_response = Some(tp::GetConnectionsResponse {
            response: MessageResult::Accepted as i32,
            active: Some(connections.to_proto(tracker)),
            imported: Some(connections.imported_to_proto(tracker)),
        });
        reply
    }

    async fn handle_set_connections(
        &self,
        tracker: &str,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        let resp = server_message::Type::SetConnectionsResponse;
        let Some(payload) = request.set_connections_request else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let Some(list) = payload.list else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let connections = self.registry.connections();
        connections.replace(tracker, &list);
        if let Err(e) = connections.save() {
            tracing::warn!(target: "control", "set-connections save failed: {}", e);
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        }
        self.registry.front().sync().await;
        ServerMessage::with_result(resp, id, MessageResult::Accepted)
    }

    fn handle_import_connections(
        &self,
        tracker: &str,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        let resp = server_message::Type::ImportConnectionsResponse;
        let Some(payload) = request.import_connections_request else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let Some(list) = payload.list else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let connections = self.registry.connections();
        for record in &list.server_connections {
            connections.add_imported(
                tracker,
                crate::connections::Record::Server(crate::connections::ServerConnection {
                    name: record.name.clone(),
                    connect_address: record.connect_address.clone(),
                    connect_port: record.connect_port as u16,
                    encrypted: record.encrypted,
                    fixed: record.fixed,
                    clients: record.clients.clone(),
                    connected: 0,
                }),
            );
        }
        for record in &list.client_connections {
            connections.add_imported(
                tracker,
                crate::connections::Record::Client(crate::connections::ClientConnection {
                    name: record.name.clone(),
                    listen_address: record.listen_address.clone(),
                    listen_port: record.listen_port as u16,
                    encrypted: record.encrypted,
                    fixed: record.fixed,
                    server: record.server.clone(),
                    connected: 0,
                }),
            );
        }
        if let Err(e) = connections.save() {
            tracing::warn!(target: "control", "import-connections save failed: {}", e);
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        }
        ServerMessage::with_result(resp, id, MessageResult::Accepted)
    }

    /// Apply a pushed roster update; gated on the tracker link so a stale
    /// CLI cannot fork the authoritative state
    async fn handle_update_connections(
        &self,
        tracker: &str,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        let resp = server_message::Type::UpdateConnectionsResponse;
        if !self.registry.tracker().is_connected(tracker) {
            return ServerMessage::with_result(resp, id, MessageResult::NoTracker);
        }
        let Some(payload) = request.update_connections_request else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let Some(list) = payload.list else {
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        };
        let connections = self.registry.connections();
        connections.merge(tracker, &list);
        if let Err(e) = connections.save() {
            tracing::warn!(target: "control", "update-connections save failed: {}", e);
            return ServerMessage::with_result(resp, id, MessageResult::Rejected);
        }
        self.registry.front().sync().await;
        ServerMessage::with_result(resp, id, MessageResult::Accepted)
    }

    /// Relay a tracker-bound request and translate the reply
    async fn forward(
        &self,
        tracker: &str,
        ty: client_message::Type,
        id: String,
        request: ClientMessage,
    ) -> ServerMessage {
        use client_message::Type as Req;

        let resp = resp_type(ty);
        let mut outbound;

        match ty {
            Req::Init => {
                outbound = Self::outbound(tp::client_message::Type::InitRequest);
                outbound.init_request = request.init_request;
            }
            Req::Confirm => {
                outbound = Self::outbound(tp::client_message::Type::ConfirmRequest);
                outbound.confirm_request = request.confirm_request;
            }
            Req::CreateDaemon => {
                outbound = Self::outbound(tp::client_message::Type::CreateDaemonRequest);
                let mut payload = request.create_daemon_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.create_daemon_request = Some(payload);
            }
            Req::DeleteDaemon => {
                outbound = Self::outbound(tp::client_message::Type::DeleteDaemonRequest);
                let mut payload = request.delete_daemon_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.delete_daemon_request = Some(payload);
            }
            Req::Create => {
                outbound = Self::outbound(tp::client_message::Type::CreateRequest);
                let mut payload = request.create_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.create_request = Some(payload);
            }
            Req::Delete => {
                outbound = Self::outbound(tp::client_message::Type::DeleteRequest);
                let mut payload = request.delete_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.delete_request = Some(payload);
            }
            Req::Import => {
                outbound = Self::outbound(tp::client_message::Type::ImportRequest);
                outbound.import_request = request.import_request;
            }
            Req::Attach => {
                outbound = Self::outbound(tp::client_message::Type::AttachRequest);
                let mut payload = request.attach_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.attach_request = Some(payload);
            }
            Req::Detach => {
                outbound = Self::outbound(tp::client_message::Type::DetachRequest);
                let mut payload = request.detach_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.detach_request = Some(payload);
            }
            Req::RemoteAttach => {
                outbound = Self::outbound(tp::client_message::Type::RemoteAttachRequest);
                let mut payload = request.remote_attach_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.remote_attach_request = Some(payload);
            }
            Req::RemoteDetach => {
                outbound = Self::outbound(tp::client_message::Type::RemoteDetachRequest);
                let mut payload = request.remote_detach_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.remote_detach_request = Some(payload);
            }
            Req::Tree => {
                outbound = Self::outbound(tp::client_message::Type::TreeRequest);
                let mut payload = request.tree_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.tree_request = Some(payload);
            }
            Req::ConnectionsList => {
                outbound = Self::outbound(tp::client_message::Type::ConnectionsListRequest);
                let mut payload = request.connections_list_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.connections_list_request = Some(payload);
            }
            Req::DaemonsList => {
                outbound = Self::outbound(tp::client_message::Type::DaemonsListRequest);
                let mut payload = request.daemons_list_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.daemons_list_request = Some(payload);
            }
            Req::RedeemMaster => {
                outbound = Self::outbound(tp::client_message::Type::RedeemMasterRequest);
                outbound.redeem_master_request = request.redeem_master_request;
            }
            Req::RedeemDaemon => {
                outbound = Self::outbound(tp::client_message::Type::RedeemDaemonRequest);
                let mut payload = request.redeem_daemon_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.redeem_daemon_request = Some(payload);
            }
            Req::RedeemPath => {
                outbound = Self::outbound(tp::client_message::Type::RedeemPathRequest);
                let mut payload = request.redeem_path_request.unwrap_or_default();
                payload.token = self.fill_token(tracker, payload.token);
                outbound.redeem_path_request = Some(payload);
            }
            // Local types are handled in dispatch
            _ => {
                return ServerMessage::with_result(resp, id, MessageResult::Rejected);
            }
        }

        // Remember the path for the local cleanup of accepted removals
        let removed_path = match ty {
            Req::Delete => outbound
                .delete_request
                .as_ref()
                .map(|r| r.path.clone()),
            Req::Detach => outbound
                .detach_request
                .as_ref()
                .map(|r| r.path.clone()),
            _ => None,
        };

        let reply = match self.roundtrip(tracker, outbound).await {
            Ok(reply) => reply,
            Err(result) => return ServerMessage::with_result(resp, id, result),
        };
        let out = self.translate_reply(tracker, ty, id, reply).await;

        if out.result == MessageResult::Accepted as i32 {
            if let Some(path) = removed_path {
                self.cleanup_connection(tracker, &path).await;
            }
        }
        out
    }

    /// Drop the local record and close live sessions of a removed
    /// connection
    async fn cleanup_connection(&self, tracker: &str, path: &str) {
        let Some((email, _)) = self.registry.tracker().registration(tracker) else {
            // Not registered: the next roster push cleans up
            return;
        };
        let name = format!("{}#{}{}", tracker, email, path);
        self.registry.peer().close_connection(&name).await;
        let connections = self.registry.connections();
        let removed = connections.delete(tracker, &name, true)
            | connections.delete(tracker, &name, false);
        if removed {
            if let Err(e) = connections.save() {
                tracing::warn!(target: "control", "roster save failed: {}", e);
            }
            self.registry.front().sync().await;
        }
    }

    /// Map a tracker reply back onto the CLI protocol, applying local side
    /// effects of accepted answers
    async fn translate_reply(
        &self,
        tracker: &str,
        ty: client_message::Type,
        id: String,
        reply: tp::ServerMessage,
    ) -> ServerMessage {
        use client_message::Type as Req;

        let resp = resp_type(ty);
        let mut out = ServerMessage::with_result(resp, id, MessageResult::Rejected);

        match ty {
            Req::Init => {
                if let Some(payload) = reply.init_response {
                    out.result = payload.response;
                }
            }
            Req::Confirm => {
                if let Some(payload) = reply.confirm_response {
                    out.result = payload.response;
                    if payload.response == MessageResult::Accepted as i32
                        && !payload.token.is_empty()
                    {
                        if let Err(e) = self.tokens.set_master_token(tracker, &payload.token) {
                            tracing::warn!(target: "control", "master token store failed: {}", e);
                        }
                    }
                    out.confirm_response = Some(payload);
                }
            }
            Req::CreateDaemon => {
                if let Some(payload) = reply.create_daemon_response {
                    out.result = payload.response;
                    out.create_daemon_response = Some(payload);
                }
            }
            Req::DeleteDaemon => {
                if let Some(payload) = reply.delete_daemon_response {
                    out.result = payload.response;
                }
            }
            Req::Create => {
                if let Some(payload) = reply.create_response {
                    out.result = payload.response;
                    if let Some(updates) = &payload.updates {
                        self.apply_updates(tracker, updates).await;
                    }
                    out.create_response = Some(payload);
                }
            }
            Req::Delete => {
                if let Some(payload) = reply.delete_response {
                    out.result = payload.response;
                }
            }
            Req::Import => {
                if let Some(payload) = reply.import_response {
                    out.result = payload.response;
                    out.import_response = Some(payload);
                }
            }
            Req::Attach => {
                if let Some(payload) = reply.attach_response {
                    out.result = payload.response;
                    if let Some(updates) = &payload.updates {
                        self.apply_updates(tracker, updates).await;
                    }
                    out.attach_response = Some(payload);
                }
            }
            Req::Detach => {
                if let Some(payload) = reply.detach_response {
                    out.result = payload.response;
                }
            }
            Req::RemoteAttach => {
                if let Some(payload) = reply.remote_attach_response {
                    out.result = payload.response;
                }
            }
            Req::RemoteDetach => {
                if let Some(payload) = reply.remote_detach_response {
                    out.result = payload.response;
                }
            }
            Req::Tree => {
                if let Some(mut payload) = reply.tree_response {
                    out.result = payload.response;
                    if let Some(tree) = &mut payload.tree {
                        sort_tree(tree);
                    }
                    out.tree_response = Some(payload);
                }
            }
            Req::ConnectionsList => {
                if let Some(payload) = reply.connections_list_response {
                    out.result = payload.response;
                    out.connections_list_response = Some(payload);
                }
            }
            Req::DaemonsList => {
                if let Some(payload) = reply.daemons_list_response {
                    out.result = payload.response;
                    out.daemons_list_response = Some(payload);
                }
            }
            Req::RedeemMaster => {
                if let Some(payload) = reply.redeem_master_response {
                    out.result = payload.response;
                }
            }
            Req::RedeemDaemon => {
                if let Some(payload) = reply.redeem_daemon_response {
                    out.result = payload.response;
                    out.redeem_daemon_response = Some(payload);
                }
            }
            Req::RedeemPath => {
                if let Some(payload) = reply.redeem_path_response {
                    out.result = payload.response;
                    out.redeem_path_response = Some(payload);
                }
            }
            _ => {}
        }

        out
    }

    /// Merge roster updates from an accepted create/attach answer
    async fn apply_updates(&self, tracker: &str, updates: &tp::ConnectionsList) {
        let connections = self.registry.connections();
        connections.merge(tracker, updates);
        if let Err(e) = connections.save() {
            tracing::warn!(target: "control", "roster save failed: {}", e);
        }
        self.registry.front().sync().await;
    }
}

/// Response type paired with each request type
fn resp_type(ty: client_message::Type) -> server_message::Type {
    use client_message::Type as Req;
    use server_message::Type as Resp;
    match ty {
        Req::Install => Resp::InstallResponse,
        Req::Init => Resp::InitResponse,
        Req::Confirm => Resp::ConfirmResponse,
        Req::CreateDaemon => Resp::CreateDaemonResponse,
        Req::DeleteDaemon => Resp::DeleteDaemonResponse,
        Req::Register => Resp::RegisterResponse,
        Req::Auth => Resp::AuthResponse,
        Req::SetToken => Resp::SetTokenResponse,
        Req::Create => Resp::CreateResponse,
        Req::Delete => Resp::DeleteResponse,
        Req::Import => Resp::ImportResponse,
        Req::Attach => Resp::AttachResponse,
        Req::Detach => Resp::DetachResponse,
        Req::RemoteAttach => Resp::RemoteAttachResponse,
        Req::RemoteDetach => Resp::RemoteDetachResponse,
        Req::Tree => Resp::TreeResponse,
        Req::ConnectionsList => Resp::ConnectionsListResponse,
        Req::DaemonsList => Resp::DaemonsListResponse,
        Req::GetConnections => Resp::GetConnectionsResponse,
        Req::SetConnections => Resp::SetConnectionsResponse,
        Req::ImportConnections => Resp::ImportConnectionsResponse,
        Req::UpdateConnections => Resp::UpdateConnectionsResponse,
        Req::RedeemMaster => Resp::RedeemMasterResponse,
        Req::RedeemDaemon => Resp::RedeemDaemonResponse,
        Req::RedeemPath => Resp::RedeemPathResponse,
    }
}

/// Order tree nodes by name, recursively, so the CLI renders stably
fn sort_tree(tree: &mut tp::Tree) {
    tree.tree.sort_by(|a, b| a.name.cmp(&b.name));
    for child in &mut tree.tree {
        sort_tree(child);
    }
}

/// The control socket path may linger after an unclean shutdown
pub fn remove_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resp_type_total() {
        use client_message::Type as Req;
        // Every request type maps to a distinct response type
        let all = [
            Req::Install,
            Req::Init,
            Req::Confirm,
            Req::CreateDaemon,
            Req::DeleteDaemon,
            Req::Register,
            Req::Auth,
            Req::SetToken,
            Req::Create,
            Req::Delete,
            Req::Import,
            Req::Attach,
            Req::Detach,
            Req::RemoteAttach,
            Req::RemoteDetach,
            Req::Tree,
            Req::ConnectionsList,
            Req::DaemonsList,
            Req::GetConnections,
            Req::SetConnections,
            Req::ImportConnections,
            Req::UpdateConnections,
            Req::RedeemMaster,
            Req::RedeemDaemon,
            Req::RedeemPath,
        ];
        let mut seen = std::collections::HashSet::new();
        for ty in all {
            assert!(seen.insert(resp_type(ty) as i32));
        }
    }

    #[test]
    fn test_sort_tree_recursive() {
        let mut tree = tp::Tree {
            name: "root".into(),
            tree: vec![
                tp::Tree {
                    name: "b".into(),
                    tree: vec![
                        tp::Tree {
                            name: "z".into(),
                            ..Default::default()
                        },
                        tp::Tree {
                            name: "a".into(),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                tp::Tree {
                    name: "a".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        sort_tree(&mut tree);
        assert_eq!(tree.tree[0].name, "a");
        assert_eq!(tree.tree[1].name, "b");
        assert_eq!(tree.tree[1].tree[0].name, "a");
        assert_eq!(tree.tree[1].tree[1].name, "z");
    }
}
