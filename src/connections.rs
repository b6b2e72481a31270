//! Connection roster
//!
//! Owns the set of active and imported connections per tracker, keeps the
//! live session counts Peer reports, and persists everything as sections of
//! `bhid.conf`. `save()` is the only durability point; callers batch
//! updates and save once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ConfigFile;
use crate::error::ConfigError;
use crate::proto::tracker as proto;

/// Server side of a connection this daemon serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnection {
    /// Full name, `tracker#email/path`
    pub name: String,
    pub connect_address: String,
    pub connect_port: u16,
    pub encrypted: bool,
    pub fixed: bool,
    /// Peers allowed to attach when fixed
    pub clients: Vec<String>,
    /// Live session count
    pub connected: u32,
}

/// Client side of a connection this daemon consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    pub name: String,
    pub listen_address: String,
    pub listen_port: u16,
    pub encrypted: bool,
    pub fixed: bool,
    /// Daemon currently serving this connection
    pub server: String,
    pub connected: u32,
}

/// One record, either role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Record {
    pub fn name(&self) -> &str {
        match self {
            Record::Server(c) => &c.name,
            Record::Client(c) => &c.name,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Record::Server(_))
    }
}

#[derive(Debug, Default, Clone)]
struct TrackerRoster {
    servers: Vec<ServerConnection>,
    clients: Vec<ClientConnection>,
    imported: Vec<Record>,
}

/// The roster of all known connections, keyed by tracker name
pub struct ConnectionsList {
    file: Arc<Mutex<ConfigFile>>,
    state: Mutex<HashMap<String, TrackerRoster>>,
}

impl ConnectionsList {
    /// Build the roster from the connection sections of `bhid.conf`
    pub fn load(file: Arc<Mutex<ConfigFile>>) -> Result<Self, ConfigError> {
        let state = {
            let conf = file.lock().unwrap();
            Self::build_state(&conf)?
        };
        Ok(ConnectionsList {
            file,
            state: Mutex::new(state),
        })
    }

    /// Re-read `bhid.conf` from disk and replace the roster (SIGHUP)
    pub fn reload(&self) -> Result<(), ConfigError> {
        let mut conf = self.file.lock().unwrap();
        let config_dir = conf
            .path()
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_default();
        *conf = ConfigFile::load(&config_dir)?;
        let state = Self::build_state(&conf)?;
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn build_state(conf: &ConfigFile) -> Result<HashMap<String, TrackerRoster>, ConfigError> {
        let mut state: HashMap<String, TrackerRoster> = HashMap::new();
        {
            let doc = &conf.document;
            let names: Vec<String> = doc
                .section_names()
                .filter(|n| n.contains('#'))
                .map(str::to_string)
                .collect();

            for name in names {
                let tracker = name.split('#').next().unwrap_or_default().to_string();
                let imported = doc.get(&name, "imported") == Some("yes");
                let record = match doc.get(&name, "type") {
                    Some("server") => Record::Server(ServerConnection {
                        name: name.clone(),
                        connect_address: doc
                            .get(&name, "connect_address")
                            .unwrap_or_default()
                            .to_string(),
                        connect_port: parse_port(doc.get(&name, "connect_port"), &name)?,
                        encrypted: doc.get(&name, "encrypted") == Some("yes"),
                        fixed: doc.get(&name, "fixed") == Some("yes"),
                        clients: split_list(doc.get(&name, "peers")),
                        connected: 0,
                    }),
                    Some("client") => Record::Client(ClientConnection {
                        name: name.clone(),
                        listen_address: doc
                            .get(&name, "listen_address")
                            .unwrap_or_default()
                            .to_string(),
                        listen_port: parse_port(doc.get(&name, "listen_port"), &name)?,
                        encrypted: doc.get(&name, "encrypted") == Some("yes"),
                        fixed: doc.get(&name, "fixed") == Some("yes"),
                        server: doc.get(&name, "server").unwrap_or_default().to_string(),
                        connected: 0,
                    }),
                    other => {
                        return Err(ConfigError::ParseError {
                            line: 0,
                            message: format!(
                                "Connection {} has invalid type {:?}",
                                name, other
                            ),
                        })
                    }
                };

                let roster = state.entry(tracker).or_default();
                if imported {
                    roster.imported.push(record);
                } else {
                    match record {
                        Record::Server(c) => roster.servers.push(c),
                        Record::Client(c) => roster.clients.push(c),
                    }
                }
            }
        }

        Ok(state)
    }

    /// Active connections for one tracker
    pub fn get(&self, tracker: &str) -> (Vec<ServerConnection>, Vec<ClientConnection>) {
        let state = self.state.lock().unwrap();
        match state.get(tracker) {
            Some(roster) => (roster.servers.clone(), roster.clients.clone()),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Imported connections for one tracker
    pub fn get_imported(&self, tracker: &str) -> Vec<Record> {
        let state = self.state.lock().unwrap();
        state
            .get(tracker)
            .map(|r| r.imported.clone())
            .unwrap_or_default()
    }

    /// Tracker names that have any connections
    pub fn trackers(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.keys().cloned().collect()
    }

    /// Look up an active record by full name
    pub fn find(&self, name: &str) -> Option<Record> {
        let tracker = name.split('#').next()?;
        let state = self.state.lock().unwrap();
        let roster = state.get(tracker)?;
        if let Some(c) = roster.servers.iter().find(|c| c.name == name) {
            return Some(Record::Server(c.clone()));
        }
        roster
            .clients
            .iter()
            .find(|c| c.name == name)
            .map(|c| Record::Client(c.clone()))
    }

    /// Replace or insert an active record
    pub fn update(&self, tracker: &str, record: Record) {
        let mut state = self.state.lock().unwrap();
        let roster = state.entry(tracker.to_string()).or_default();
        // An attach supersedes any imported copy of the same connection
        roster.imported.retain(|r| r.name() != record.name());
        match record {
            Record::Server(c) => {
                roster.clients.retain(|old| old.name != c.name);
                match roster.servers.iter_mut().find(|old| old.name == c.name) {
                    Some(old) => *old = c,
                    None => roster.servers.push(c),
                }
            }
            Record::Client(c) => {
                roster.servers.retain(|old| old.name != c.name);
                match roster.clients.iter_mut().find(|old| old.name == c.name) {
                    Some(old) => *old = c,
                    None => roster.clients.push(c),
                }
            }
        }
    }

    /// Remove an active record
    pub fn delete(&self, tracker: &str, name: &str, is_server: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(roster) = state.get_mut(tracker) else {
            return false;
        };
        if is_server {
            let before = roster.servers.len();
            roster.servers.retain(|c| c.name != name);
            roster.servers.len() != before
        } else {
            let before = roster.clients.len();
            roster.clients.retain(|c| c.name != name);
            roster.clients.len() != before
        }
    }

    /// Store an imported record, replacing an earlier import of the same name
    pub fn add_imported(&self, tracker: &str, record: Record) {
        let mut state = self.state.lock().unwrap();
        let roster = state.entry(tracker.to_string()).or_default();
        roster.imported.retain(|r| r.name() != record.name());
        roster.imported.push(record);
    }

    /// Replace the whole active roster for a tracker from a tracker push
    pub fn replace(&self, tracker: &str, list: &proto::ConnectionsList) {
        let mut state = self.state.lock().unwrap();
        let roster = state.entry(tracker.to_string()).or_default();
        roster.servers = list.server_connections.iter().map(server_from_proto).collect();
        roster.clients = list.client_connections.iter().map(client_from_proto).collect();
    }

    /// Merge a partial update (create/attach responses carry these)
    pub fn merge(&self, tracker: &str, list: &proto::ConnectionsList) {
        for c in &list.server_connections {
            self.update(tracker, Record::Server(server_from_proto(c)));
        }
        for c in &list.client_connections {
            self.update(tracker, Record::Client(client_from_proto(c)));
        }
    }

    /// Adjust the live session count for a connection, returning the new value
    pub fn set_session_count(&self, name: &str, count: u32) -> Option<u32> {
        let tracker = name.split('#').next()?;
        let mut state = self.state.lock().unwrap();
        let roster = state.get_mut(tracker)?;
        if let Some(c) = roster.servers.iter_mut().find(|c| c.name == name) {
            c.connected = count;
            return Some(c.connected);
        }
        if let Some(c) = roster.clients.iter_mut().find(|c| c.name == name) {
            c.connected = count;
            return Some(c.connected);
        }
        None
    }

    /// Active roster for one tracker as a wire list
    pub fn to_proto(&self, tracker: &str) -> proto::ConnectionsList {
        let (servers, clients) = self.get(tracker);
        proto::ConnectionsList {
            server_connections: servers.iter().map(server_to_proto).collect(),
            client_connections: clients.iter().map(client_to_proto).collect(),
        }
    }

    /// Imported roster for one tracker as a wire list
    pub fn imported_to_proto(&self, tracker: &str) -> proto::ConnectionsList {
        let mut list = proto::ConnectionsList::default();
        for record in self.get_imported(tracker) {
            match record {
                Record::Server(c) => list.server_connections.push(server_to_proto(&c)),
                Record::Client(c) => list.client_connections.push(client_to_proto(&c)),
            }
        }
        list
    }

    /// Rewrite the connection sections of `bhid.conf` and save it
    pub fn save(&self) -> Result<(), ConfigError> {
        let state = self.state.lock().unwrap();
        let mut conf = self.file.lock().unwrap();

        let stale: Vec<String> = conf
            .document
            .section_names()
            .filter(|n| n.contains('#'))
            .map(str::to_string)
            .collect();
        for name in stale {
            conf.document.remove_section(&name);
        }

        for roster in state.values() {
            for c in &roster.servers {
                write_server(&mut conf, c, false);
            }
            for c in &roster.clients {
                write_client(&mut conf, c, false);
            }
            for record in &roster.imported {
                match record {
                    Record::Server(c) => write_server(&mut conf, c, true),
                    Record::Client(c) => write_client(&mut conf, c, true),
                }
            }
        }

        conf.save()
    }
}

fn parse_port(raw: Option<&str>, section: &str) -> Result<u16, ConfigError> {
    let raw = raw.unwrap_or("0");
    raw.parse().map_err(|_| ConfigError::ParseError {
        line: 0,
        message: format!("Connection {} has invalid port {}", section, raw),
    })
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn write_server(conf: &mut ConfigFile, c: &ServerConnection, imported: bool) {
    let doc = &mut conf.document;
    doc.set(&c.name, "type", "server");
    doc.set(&c.name, "connect_address", c.connect_address.clone());
    doc.set(&c.name, "connect_port", c.connect_port.to_string());
    doc.set(&c.name, "encrypted", yes_no(c.encrypted));
    doc.set(&c.name, "fixed", yes_no(c.fixed));
    if c.clients.is_empty() {
        doc.unset(&c.name, "peers");
    } else {
        doc.set(&c.name, "peers", c.clients.join(","));
    }
    if imported {
        doc.set(&c.name, "imported", "yes");
    }
}

fn write_client(conf: &mut ConfigFile, c: &ClientConnection, imported: bool) {
    let doc = &mut conf.document;
    doc.set(&c.name, "type", "client");
    doc.set(&c.name, "listen_address", c.listen_address.clone());
    doc.set(&c.name, "listen_port", c.listen_port.to_string());
    doc.set(&c.name, "encrypted", yes_no(c.encrypted));
    doc.set(&c.name, "fixed", yes_no(c.fixed));
    doc.set(&c.name, "server", c.server.clone());
    if imported {
        doc.set(&c.name, "imported", "yes");
    }
}

fn server_from_proto(c: &proto::ServerConnection) -> ServerConnection {
    ServerConnection {
        name: c.name.clone(),
        connect_address: c.connect_address.clone(),
        connect_port: c.connect_port as u16,
        encrypted: c.encrypted,
        fixed: c.fixed,
        clients: c.clients.clone(),
        connected: c.connected,
    }
}

fn client_from_proto(c: &proto::ClientConnection) -> ClientConnection {
    ClientConnection {
        name: c.name.clone(),
        listen_address: c.listen_address.clone(),
        listen_port: c.listen_port as u16,
        encrypted: c.encrypted,
        fixed: c.fixed,
        server: c.server.clone(),
        connected: c.connected,
    }
}

fn server_to_proto(c: &ServerConnection) -> proto::ServerConnection {
    proto::ServerConnection {
        name: c.name.clone(),
        connect_address: c.connect_address.clone(),
        connect_port: c.connect_port as u32,
        encrypted: c.encrypted,
        fixed: c.fixed,
        clients: c.clients.clone(),
        connected: c.connected,
    }
}

fn client_to_proto(c: &ClientConnection) -> proto::ClientConnection {
    proto::ClientConnection {
        name: c.name.clone(),
        listen_address: c.listen_address.clone(),
        listen_port: c.listen_port as u32,
        encrypted: c.encrypted,
        fixed: c.fixed,
        server: c.server.clone(),
        connected: c.connected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{write_atomic, CONF_MODE};
    use std::path::Path;

    fn load_fixture(content: &str) -> (tempfile::TempDir, ConnectionsList) {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(&dir.path().join("bhid.conf"), content.as_bytes(), CONF_MODE).unwrap();
        let file = ConfigFile::load(dir.path()).unwrap();
        let list = ConnectionsList::load(Arc::new(Mutex::new(file))).unwrap();
        (dir, list)
    }

    const FIXTURE: &str = "\
[daemon]\n\n\
[t1]\n\n\
[t1#user@example.com/svc]\n\
type = server\n\
connect_address = 127.0.0.1\n\
connect_port = 9001\n\
encrypted = yes\n\
fixed = yes\n\
peers = other?daemon\n\n\
[t1#user@example.com/web]\n\
type = client\n\
listen_address = 127.0.0.1\n\
listen_port = 9000\n\
encrypted = no\n\
fixed = no\n\
server = user?first\n";

    #[test]
    fn test_load_roster() {
        let (_dir, list) = load_fixture(FIXTURE);
        let (servers, clients) = list.get("t1");
        assert_eq!(servers.len(), 1);
        assert_eq!(clients.len(), 1);
        assert_eq!(servers[0].name, "t1#user@example.com/svc");
        assert!(servers[0].fixed);
        assert_eq!(servers[0].clients, vec!["other?daemon".to_string()]);
        assert_eq!(clients[0].listen_port, 9000);
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, list) = load_fixture(FIXTURE);
        list.update(
            "t1",
            Record::Client(ClientConnection {
                name: "t1#user@example.com/new".into(),
                listen_address: "127.0.0.1".into(),
                listen_port: 9100,
                encrypted: false,
                fixed: false,
                server: String::new(),
                connected: 0,
            }),
        );
        let (_, clients) = list.get("t1");
        assert_eq!(clients.len(), 2);

        assert!(list.delete("t1", "t1#user@example.com/new", false));
        assert!(!list.delete("t1", "t1#user@example.com/new", false));
    }

    #[test]
    fn test_role_switch_replaces_old_record() {
        let (_dir, list) = load_fixture(FIXTURE);
        // The same connection re-attached in the other role drops the old entry
        list.update(
            "t1",
            Record::Server(ServerConnection {
                name: "t1#user@example.com/web".into(),
                connect_address: "127.0.0.1".into(),
                connect_port: 9001,
                encrypted: false,
                fixed: false,
                clients: Vec::new(),
                connected: 0,
            }),
        );
        let (servers, clients) = list.get("t1");
        assert_eq!(servers.len(), 2);
        assert!(clients.is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let (dir, list) = load_fixture(FIXTURE);
        list.add_imported(
            "t1",
            Record::Client(ClientConnection {
                name: "t1#user@example.com/imp".into(),
                listen_address: String::new(),
                listen_port: 0,
                encrypted: true,
                fixed: false,
                server: String::new(),
                connected: 0,
            }),
        );
        list.save().unwrap();

        let file = ConfigFile::load(dir.path()).unwrap();
        let reloaded = ConnectionsList::load(Arc::new(Mutex::new(file))).unwrap();
        let (servers, clients) = reloaded.get("t1");
        assert_eq!(servers.len(), 1);
        assert_eq!(clients.len(), 1);
        let imported = reloaded.get_imported("t1");
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].name(), "t1#user@example.com/imp");

        // Non-connection sections survive the rewrite
        assert!(Path::new(&dir.path().join("bhid.conf")).exists());
        let conf = std::fs::read_to_string(dir.path().join("bhid.conf")).unwrap();
        assert!(conf.contains("[daemon]"));
        assert!(conf.contains("[t1]"));
    }

    #[test]
    fn test_session_counts() {
        let (_dir, list) = load_fixture(FIXTURE);
        assert_eq!(
            list.set_session_count("t1#user@example.com/svc", 2),
            Some(2)
        );
        assert_eq!(list.set_session_count("t1#user@example.com/none", 1), None);
        let (servers, _) = list.get("t1");
        assert_eq!(servers[0].connected, 2);
    }

    #[test]
    fn test_attach_supersedes_import() {
        let (_dir, list) = load_fixture(FIXTURE);
        list.add_imported(
            "t1",
            Record::Client(ClientConnection {
                name: "t1#user@example.com/dup".into(),
                listen_address: String::new(),
                listen_port: 0,
                encrypted: false,
                fixed: false,
                server: String::new(),
                connected: 0,
            }),
        );
        list.update(
            "t1",
            Record::Client(ClientConnection {
                name: "t1#user@example.com/dup".into(),
                listen_address: "127.0.0.1".into(),
                listen_port: 9200,
                encrypted: false,
                fixed: false,
                server: String::new(),
                connected: 0,
            }),
        );
        assert!(list.get_imported("t1").is_empty());
    }
}
