//! Token storage
//!
//! Daemon tokens live in the tracker's section of `bhid.conf`; master
//! tokens live one file per tracker under the protected `master/`
//! directory. Every write is an atomic rewrite with tight permissions.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{write_atomic, ConfigFile};
use crate::error::ConfigError;

/// Mode for the master token directory
const MASTER_DIR_MODE: u32 = 0o700;

/// Mode for token files
const TOKEN_MODE: u32 = 0o600;

#[derive(Clone)]
pub struct Tokens {
    file: Arc<Mutex<ConfigFile>>,
    master_dir: PathBuf,
}

impl Tokens {
    pub fn new(file: Arc<Mutex<ConfigFile>>, master_dir: PathBuf) -> Self {
        Tokens { file, master_dir }
    }

    /// Daemon token for a tracker, if the daemon was created there
    pub fn daemon_token(&self, tracker: &str) -> Option<String> {
        let conf = self.file.lock().unwrap();
        conf.document
            .get(tracker, "token")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    pub fn set_daemon_token(&self, tracker: &str, token: &str) -> Result<(), ConfigError> {
        let mut conf = self.file.lock().unwrap();
        conf.document.set(tracker, "token", token);
        conf.save()
    }

    pub fn master_token(&self, tracker: &str) -> Option<String> {
        let path = self.master_path(tracker);
        let token = std::fs::read_to_string(path).ok()?;
        let token = token.trim().to_string();
        (!token.is_empty()).then_some(token)
    }

    pub fn set_master_token(&self, tracker: &str, token: &str) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.master_dir)?;
        std::fs::set_permissions(
            &self.master_dir,
            std::fs::Permissions::from_mode(MASTER_DIR_MODE),
        )?;
        write_atomic(&self.master_path(tracker), token.as_bytes(), TOKEN_MODE)?;
        Ok(())
    }

    fn master_path(&self, tracker: &str) -> PathBuf {
        self.master_dir
            .join(format!("{}.token", tracker.replace('/', "_")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONF_MODE;

    fn setup() -> (tempfile::TempDir, Tokens) {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(
            &dir.path().join("bhid.conf"),
            b"[daemon]\n\n[t1]\n",
            CONF_MODE,
        )
        .unwrap();
        let file = Arc::new(Mutex::new(ConfigFile::load(dir.path()).unwrap()));
        let tokens = Tokens::new(file, dir.path().join("master"));
        (dir, tokens)
    }

    #[test]
    fn test_daemon_token_round_trip() {
        let (dir, tokens) = setup();
        assert!(tokens.daemon_token("t1").is_none());
        tokens.set_daemon_token("t1", "secret").unwrap();
        assert_eq!(tokens.daemon_token("t1").as_deref(), Some("secret"));

        // Persisted through the config file
        let reloaded = ConfigFile::load(dir.path()).unwrap();
        assert_eq!(reloaded.document.get("t1", "token"), Some("secret"));
    }

    #[test]
    fn test_master_token_round_trip() {
        let (dir, tokens) = setup();
        assert!(tokens.master_token("t1").is_none());
        tokens.set_master_token("t1", "master-secret").unwrap();
        assert_eq!(tokens.master_token("t1").as_deref(), Some("master-secret"));

        let mode = std::fs::metadata(dir.path().join("master"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, MASTER_DIR_MODE);
        let mode = std::fs::metadata(dir.path().join("master/t1.token"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, TOKEN_MODE);
    }
}
