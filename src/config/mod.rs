//! Daemon configuration
//!
//! `bhid.conf` is one INI file holding the `[daemon]` section, one section
//! per configured tracker, and one section per known connection (section
//! names with a `#` belong to the connection roster, see
//! [`crate::connections`]). The file is the single durability point; every
//! rewrite goes through a temp file and rename.

pub mod ini;

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use ini::IniDocument;

/// Default configuration directory
#[cfg(target_os = "freebsd")]
pub const DEFAULT_CONFIG_DIR: &str = "/usr/local/etc/bhid";
#[cfg(not(target_os = "freebsd"))]
pub const DEFAULT_CONFIG_DIR: &str = "/etc/bhid";

/// Default runtime directory (sockets, pidfile)
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run/bhid";

/// Default UDP port for the shared UTP socket
pub const DEFAULT_UTP_PORT: u16 = 42049;

/// Default tracker TCP port
pub const DEFAULT_TRACKER_PORT: u16 = 42042;

/// Mode for `bhid.conf`
pub const CONF_MODE: u32 = 0o640;

/// One configured tracker endpoint
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Section name, used as the tracker identifier everywhere
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Daemon token, present once the daemon was created on this tracker
    pub token: Option<String>,
}

/// Static configuration parsed from `bhid.conf`
#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
    /// Socket/pidfile suffix for running several daemons side by side
    pub suffix: Option<String>,
    pub utp_port: u16,
    pub trackers: Vec<TrackerConfig>,
}

impl Config {
    /// Parse the static parts out of a loaded document
    pub fn from_document(
        config_dir: &Path,
        suffix: Option<String>,
        doc: &IniDocument,
    ) -> Result<Self, ConfigError> {
        let runtime_dir = doc
            .get("daemon", "runtime_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR));

        let suffix = suffix.or_else(|| doc.get("daemon", "suffix").map(str::to_string));

        let utp_port = match doc.get("daemon", "utp_port") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidAddress {
                value: raw.to_string(),
            })?,
            None => DEFAULT_UTP_PORT,
        };

        let mut trackers = Vec::new();
        for name in doc.section_names() {
            if name == "daemon" || name.contains('#') {
                continue;
            }
            let address = doc.get(name, "address").unwrap_or(name).to_string();
            let port = match doc.get(name, "port") {
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidAddress {
                    value: raw.to_string(),
                })?,
                None => DEFAULT_TRACKER_PORT,
            };
            let token = doc
                .get(name, "token")
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            trackers.push(TrackerConfig {
                name: name.to_string(),
                address,
                port,
                token,
            });
        }

        Ok(Config {
            config_dir: config_dir.to_path_buf(),
            runtime_dir,
            suffix,
            utp_port,
            trackers,
        })
    }

    pub fn conf_path(&self) -> PathBuf {
        self.config_dir.join("bhid.conf")
    }

    pub fn id_dir(&self) -> PathBuf {
        self.config_dir.join("id")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.id_dir().join("public.rsa")
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.id_dir().join("private.rsa")
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.config_dir.join("peers")
    }

    pub fn master_dir(&self) -> PathBuf {
        self.config_dir.join("master")
    }

    pub fn pidfile_path(&self) -> PathBuf {
        match &self.suffix {
            Some(suffix) => PathBuf::from(format!("/var/run/bhid.{}.pid", suffix)),
            None => PathBuf::from("/var/run/bhid.pid"),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.suffix {
            Some(suffix) => self.runtime_dir.join(format!("daemon.{}.sock", suffix)),
            None => self.runtime_dir.join("daemon.sock"),
        }
    }

    pub fn tracker(&self, name: &str) -> Option<&TrackerConfig> {
        self.trackers.iter().find(|t| t.name == name)
    }
}

/// The live `bhid.conf` document plus its location and mode
#[derive(Debug)]
pub struct ConfigFile {
    pub document: IniDocument,
    path: PathBuf,
    mode: u32,
}

impl ConfigFile {
    /// Load `bhid.conf`, performing the one-time section escape migration
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join("bhid.conf");
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ConfigError::PermissionDenied {
                path: path.display().to_string(),
            },
            _ => ConfigError::Io(e),
        })?;

        let mode = fs::metadata(&path)
            .map(|m| m.permissions().mode() & 0o777)
            .unwrap_or(CONF_MODE);

        let parsed = IniDocument::parse(&content)?;
        let file = ConfigFile {
            document: parsed.document,
            path,
            mode,
        };

        if parsed.migrated {
            tracing::info!("Migrating legacy section escapes in {}", file.path.display());
            file.save()?;
        }

        Ok(file)
    }

    /// Rewrite the file atomically, preserving its mode
    pub fn save(&self) -> Result<(), ConfigError> {
        write_atomic(&self.path, self.document.serialize().as_bytes(), self.mode)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write a file via temp + rename, with the given mode
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_conf(dir: &Path, content: &str) {
        fs::write(dir.join("bhid.conf"), content).unwrap();
        fs::set_permissions(
            dir.join("bhid.conf"),
            fs::Permissions::from_mode(CONF_MODE),
        )
        .unwrap();
    }

    #[test]
    fn test_load_and_parse_trackers() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            "[daemon]\nutp_port = 45000\n\n[tracker.example.com]\nport = 42042\ntoken = abc\n",
        );

        let file = ConfigFile::load(dir.path()).unwrap();
        let config = Config::from_document(dir.path(), None, &file.document).unwrap();

        assert_eq!(config.utp_port, 45000);
        assert_eq!(config.trackers.len(), 1);
        let tracker = &config.trackers[0];
        assert_eq!(tracker.name, "tracker.example.com");
        assert_eq!(tracker.address, "tracker.example.com");
        assert_eq!(tracker.port, 42042);
        assert_eq!(tracker.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_connection_sections_are_not_trackers() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(
            dir.path(),
            "[daemon]\n\n[t1]\n\n[t1#user@example.com/path]\ntype = server\n",
        );

        let file = ConfigFile::load(dir.path()).unwrap();
        let config = Config::from_document(dir.path(), None, &file.document).unwrap();
        assert_eq!(config.trackers.len(), 1);
        assert_eq!(config.trackers[0].name, "t1");
    }

    #[test]
    fn test_migration_rewrites_once_preserving_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "[user\\.name\\#1]\nkey = value\n");

        let file = ConfigFile::load(dir.path()).unwrap();
        assert!(file.document.has_section("user.name#1"));

        let on_disk = fs::read_to_string(dir.path().join("bhid.conf")).unwrap();
        assert!(on_disk.contains("[user.name#1]"));
        let mode = fs::metadata(dir.path().join("bhid.conf"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, CONF_MODE);

        // Second load sees no escapes
        let parsed = ini::IniDocument::parse(&on_disk).unwrap();
        assert!(!parsed.migrated);
    }

    #[test]
    fn test_missing_conf() {
        let dir = tempfile::tempdir().unwrap();
        match ConfigFile::load(dir.path()) {
            Err(ConfigError::FileNotFound { .. }) => {}
            other => panic!("expected FileNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_socket_and_pidfile_suffix() {
        let doc = IniDocument::new();
        let config =
            Config::from_document(Path::new("/etc/bhid"), Some("second".into()), &doc).unwrap();
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/var/run/bhid/daemon.second.sock")
        );
        assert_eq!(
            config.pidfile_path(),
            PathBuf::from("/var/run/bhid.second.pid")
        );
    }
}
