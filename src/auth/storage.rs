//! Session persistence.
//!
//! Stores credentials in `~/.local/share/nimbus/session.json`, keyed by
//! profile name, so a later process can resume without logging in again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::Credential;

/// A saved login for one API deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// API base URL the credential was issued for.
    pub base_url: String,
    /// The credential, including any refresh token.
    pub credential: Credential,
    /// When the session was last written.
    pub saved_at: DateTime<Utc>,
}

impl Session {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            base_url: base_url.into(),
            credential,
            saved_at: Utc::now(),
        }
    }

    /// Whether this session belongs to `base_url`, ignoring a trailing slash.
    pub fn matches(&self, base_url: &str) -> bool {
        self.base_url.trim_end_matches('/') == base_url.trim_end_matches('/')
    }
}

/// Storage for saved sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStore {
    /// Map of profile name to session.
    pub sessions: HashMap<String, Session>,
}

impl SessionStore {
    /// Get the default storage path.
    ///
    /// Returns `~/.local/share/nimbus/session.json` on Linux.
    pub fn default_path() -> Result<PathBuf> {
        let data_dir =
            dirs::data_local_dir().context("Could not determine local data directory")?;
        Ok(data_dir.join("nimbus").join("session.json"))
    }

    /// Load sessions from the default storage path.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    /// Load sessions from a specific path.
    ///
    /// Returns an empty store if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open session file: {}", path.display()))?;
        let reader = BufReader::new(file);

        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))
    }

    /// Save sessions to the default storage path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    /// Save sessions to a specific path.
    ///
    /// Creates parent directories if needed and sets file permissions to 0600.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = File::create(path)
            .with_context(|| format!("Failed to create session file: {}", path.display()))?;

        #[cfg(unix)]
        {
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }

        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;

        Ok(())
    }

    pub fn get(&self, profile: &str) -> Option<&Session> {
        self.sessions.get(profile)
    }

    /// The credential saved for `profile`, if it was issued for `base_url`.
    pub fn credential_for(&self, profile: &str, base_url: &str) -> Option<&Credential> {
        self.get(profile)
            .filter(|session| session.matches(base_url))
            .map(|session| &session.credential)
    }

    pub fn set(&mut self, profile: impl Into<String>, session: Session) {
        self.sessions.insert(profile.into(), session);
    }

    pub fn remove(&mut self, profile: &str) -> Option<Session> {
        self.sessions.remove(profile)
    }

    pub fn has(&self, profile: &str) -> bool {
        self.sessions.contains_key(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_matches_base_url() {
        let session = Session::new("https://app.example.com/", Credential::token("abc"));
        assert!(session.matches("https://app.example.com"));
        assert!(!session.matches("https://other.example.com"));
    }

    #[test]
    fn test_store_set_get_remove() {
        let mut store = SessionStore::default();
        store.set(
            "default",
            Session::new("https://app.example.com", Credential::token("abc")),
        );

        assert!(store.has("default"));
        assert_eq!(
            store
                .credential_for("default", "https://app.example.com")
                .map(Credential::access_token),
            Some("abc")
        );
        assert!(store
            .credential_for("default", "https://other.example.com")
            .is_none());

        store.remove("default");
        assert!(!store.has("default"));
    }

    #[test]
    fn test_store_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("session.json");

        let mut store = SessionStore::default();
        store.set(
            "work",
            Session::new(
                "https://app.example.com",
                Credential::oauth2("access", "bearer", Some("refresh".to_string()), None),
            ),
        );
        store.save_to(&path).unwrap();

        let loaded = SessionStore::load_from(&path).unwrap();
        let session = loaded.get("work").unwrap();
        assert_eq!(session.credential.access_token(), "access");
        assert_eq!(session.credential.refresh_token(), Some("refresh"));
    }

    #[test]
    fn test_store_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nonexistent.json");

        let store = SessionStore::load_from(&path).unwrap();
        assert!(store.sessions.is_empty());
    }

    #[test]
    fn test_store_load_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        fs::write(&path, "not json").unwrap();

        let err = SessionStore::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse session file"));
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        SessionStore::default().save_to(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "File should have 0600 permissions");
    }
}
