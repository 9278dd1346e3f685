//! Persisted out-of-band session state.
//!
//! A session binds a correlation-id prefix and the secret used to decrypt
//! polled interactions. It is persisted to a single JSON file so a restart
//! resumes the same prefix instead of orphaning already-issued
//! identifiers.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::OobError;

/// Length of the correlation-id prefix every full-id starts with.
pub const CORRELATION_ID_LEN: usize = 20;
/// Length of the per-call suffix appended by `oob_url`.
pub const FULL_ID_SUFFIX_LEN: usize = 13;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase-alphanumeric identifier of the given length.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// The singleton session bound to the external OOB server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobSession {
    pub correlation_id: String,
    /// Base64 of 32 random bytes; the AES key is derived from this.
    pub secret_key: String,
    pub server_url: String,
    pub registered_at: DateTime<Utc>,
}

impl OobSession {
    /// Mint a fresh session for `server_url`.
    pub fn mint(server_url: impl Into<String>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);
        Self {
            correlation_id: random_id(CORRELATION_ID_LEN),
            secret_key: BASE64.encode(secret),
            server_url: server_url.into(),
            registered_at: Utc::now(),
        }
    }

    /// Load a persisted session; `None` when no file exists (a fresh
    /// session is minted in that case, losing the session file is
    /// non-fatal).
    pub async fn load(path: &Path) -> Result<Option<Self>, OobError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OobError::Session(e)),
        }
    }

    /// Write the session file, creating parent directories as needed.
    pub async fn persist(&self, path: &Path) -> Result<(), OobError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// The domain interaction hosts live under, derived from the server
    /// URL.
    pub fn oob_domain(&self) -> Result<String, OobError> {
        let url = Url::parse(&self.server_url).map_err(|e| OobError::Poll {
            reason: format!("invalid server url {:?}: {e}", self.server_url),
        })?;
        url.host_str()
            .map(|h| h.to_string())
            .ok_or_else(|| OobError::Poll {
                reason: format!("server url {:?} has no host", self.server_url),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minted_sessions_are_unique() {
        let a = OobSession::mint("https://oob.example.test");
        let b = OobSession::mint("https://oob.example.test");
        assert_eq!(a.correlation_id.len(), CORRELATION_ID_LEN);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.secret_key, b.secret_key);
    }

    #[test]
    fn domain_comes_from_server_url() {
        let session = OobSession::mint("https://oob.example.test:8443/api");
        assert_eq!(session.oob_domain().unwrap(), "oob.example.test");
    }

    #[tokio::test]
    async fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        assert!(OobSession::load(&path).await.unwrap().is_none());

        let session = OobSession::mint("https://oob.example.test");
        session.persist(&path).await.unwrap();

        let loaded = OobSession::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.correlation_id, session.correlation_id);
        assert_eq!(loaded.secret_key, session.secret_key);
    }
}
