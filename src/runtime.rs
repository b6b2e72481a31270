//! Daemon runtime
//!
//! Builds every component in dependency order, populates the registry,
//! then runs the event loop that routes Peer events to Front and turns
//! session lifecycle changes into tracker status reports. SIGHUP reloads
//! `bhid.conf`; SIGTERM and Ctrl+C shut down after removing the pidfile
//! and the control socket.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::{write_atomic, Config, ConfigFile};
use crate::connections::ConnectionsList;
use crate::control::{remove_socket, ControlServer};
use crate::crypto::{identity::Identity, Crypter};
use crate::error::{BhidError, ConfigError, Result};
use crate::front::Front;
use crate::peer::{Peer, PeerEvent};
use crate::registry::Registry;
use crate::tracker::{Tokens, TrackerHandle};

pub struct Options {
    pub config_dir: PathBuf,
    pub suffix: Option<String>,
}

/// Build all components and run until a termination signal
pub async fn run(options: Options) -> Result<()> {
    let config_file = ConfigFile::load(&options.config_dir)?;
    let config = Arc::new(Config::from_document(
        &options.config_dir,
        options.suffix,
        &config_file.document,
    )?);
    let file = Arc::new(Mutex::new(config_file));

    let identity = Identity::load(&config.public_key_path(), &config.private_key_path())?;
    let crypter = Arc::new(Crypter::new(identity, config.peers_dir()));
    tracing::info!("daemon identity {}", crypter.identity());

    let connections = Arc::new(ConnectionsList::load(file.clone())?);

    let registry = Registry::new();
    registry.set_config(config.clone());
    registry.set_crypter(crypter);
    registry.set_connections(connections.clone());

    let front = Front::new(registry.clone());
    registry.set_front(front.clone());

    let tokens = Tokens::new(file, config.master_dir());
    let tracker = TrackerHandle::new(registry.clone(), tokens.clone(), &config.trackers);
    registry.set_tracker(tracker.clone());

    // Small on purpose: a stalled consumer must throttle the producing
    // sessions instead of queueing unbounded tunnel data
    let (events_tx, events_rx) = mpsc::channel(32);
    let bind = SocketAddr::from(([0, 0, 0, 0], config.utp_port));
    let peer = Peer::start(registry.clone(), bind, events_tx).await?;
    registry.set_peer(peer);

    tracker.spawn();
    front.sync().await;

    write_pidfile(&config.pidfile_path())?;
    if let Err(e) = ControlServer::start(registry.clone(), tokens, config.socket_path()) {
        remove_pidfile(&config.pidfile_path());
        return Err(control_bind_error(e, &config.socket_path()));
    }

    let outcome = event_loop(&registry, events_rx).await;

    remove_pidfile(&config.pidfile_path());
    remove_socket(&config.socket_path());
    outcome
}

/// Route peer events and react to signals
async fn event_loop(
    registry: &Arc<Registry>,
    mut events_rx: mpsc::Receiver<PeerEvent>,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => route_event(registry, event).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                reload(registry).await;
            }
        }
    }
    Ok(())
}

async fn route_event(registry: &Arc<Registry>, event: PeerEvent) {
    match event {
        PeerEvent::Established { connection, .. } => {
            registry.tracker().send_status(&connection).await;
        }
        PeerEvent::Closed {
            session_id,
            connection,
            was_established,
        } => {
            registry.front().handle_session_closed(session_id).await;
            if was_established && !connection.is_empty() {
                registry.tracker().send_status(&connection).await;
            }
        }
        PeerEvent::Inner {
            session_id,
            message,
            ..
        } => {
            registry.front().handle_inner(session_id, message).await;
        }
    }
}

async fn reload(registry: &Arc<Registry>) {
    match registry.connections().reload() {
        Ok(()) => {
            registry.front().sync().await;
            tracing::info!("configuration reloaded");
        }
        Err(e) => {
            tracing::error!("reload failed: {}", e);
        }
    }
}

/// Write the pidfile, refusing to clobber one held by a live process
fn write_pidfile(path: &Path) -> Result<()> {
    if let Ok(content) = std::fs::read_to_string(path) {
        if let Ok(pid) = content.trim().parse::<u32>() {
            if Path::new(&format!("/proc/{}", pid)).exists() {
                return Err(BhidError::Config(ConfigError::PidfileConflict {
                    path: path.display().to_string(),
                    pid,
                }));
            }
        }
    }
    write_atomic(path, format!("{}\n", std::process::id()).as_bytes(), 0o644)
        .map_err(|e| BhidError::Config(ConfigError::Io(e)))
}

fn remove_pidfile(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn control_bind_error(e: std::io::Error, path: &Path) -> BhidError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            BhidError::Config(ConfigError::PermissionDenied {
                path: path.display().to_string(),
            })
        }
        _ => BhidError::System(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhid.pid");

        // Our own pid is alive, so a pidfile carrying it conflicts
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(
            write_pidfile(&path),
            Err(BhidError::Config(ConfigError::PidfileConflict { .. }))
        ));
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhid.pid");

        // Pid far beyond pid_max never exists
        std::fs::write(&path, "4194305000\n").unwrap();
        write_pidfile(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        remove_pidfile(&path);
        assert!(!path.exists());
    }
}
