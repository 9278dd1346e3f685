//! Client for the external out-of-band server.
//!
//! The wire protocol is small: register a correlation id, poll for
//! interactions (returned as AES-GCM blobs only the session secret can
//! open), keep the registration alive, deregister. Implementations are a
//! trait so tests can substitute a scripted server.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OobError;
use crate::interactions::session::OobSession;

const NONCE_LEN: usize = 12;

/// One interaction as the server reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInteraction {
    pub protocol: String,
    pub full_id: String,
    pub remote_address: String,
    pub timestamp: DateTime<Utc>,
    pub raw_data: String,
}

/// Operations against the OOB server.
#[async_trait]
pub trait OobClient: Send + Sync {
    async fn register(&self, session: &OobSession) -> Result<(), OobError>;

    /// Fetch and decrypt pending interactions. `Err(OobError::Evicted)`
    /// signals that the server no longer knows our correlation prefix.
    async fn poll(&self, session: &OobSession) -> Result<Vec<RawInteraction>, OobError>;

    async fn keep_alive(&self, session: &OobSession) -> Result<(), OobError>;

    async fn deregister(&self, session: &OobSession) -> Result<(), OobError>;
}

/// AES key for a session: SHA-256 of the secret-key string.
fn session_key(session: &OobSession) -> [u8; 32] {
    let digest = Sha256::digest(session.secret_key.as_bytes());
    digest.into()
}

/// Open one `base64(nonce || ciphertext)` blob into an interaction.
pub(crate) fn decrypt_interaction(
    session: &OobSession,
    blob: &str,
) -> Result<RawInteraction, OobError> {
    let bytes = BASE64.decode(blob).map_err(|_| OobError::Decrypt)?;
    if bytes.len() <= NONCE_LEN {
        return Err(OobError::Decrypt);
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let cipher =
        Aes256Gcm::new_from_slice(&session_key(session)).map_err(|_| OobError::Decrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OobError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    #[serde(rename = "correlation-id")]
    correlation_id: &'a str,
    #[serde(rename = "secret-key")]
    secret_key: &'a str,
}

#[derive(Deserialize)]
struct PollBody {
    #[serde(default)]
    data: Vec<String>,
}

/// The production client.
pub struct HttpOobClient {
    client: reqwest::Client,
}

impl HttpOobClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpOobClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OobClient for HttpOobClient {
    async fn register(&self, session: &OobSession) -> Result<(), OobError> {
        let response = self
            .client
            .post(format!("{}/register", session.server_url))
            .json(&RegisterBody {
                correlation_id: &session.correlation_id,
                secret_key: &session.secret_key,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OobError::Poll {
                reason: format!("register returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn poll(&self, session: &OobSession) -> Result<Vec<RawInteraction>, OobError> {
        let response = self
            .client
            .get(format!("{}/poll", session.server_url))
            .query(&[("id", session.correlation_id.as_str())])
            .send()
            .await?;
        match response.status().as_u16() {
            401 | 410 => return Err(OobError::Evicted),
            status if status >= 400 => {
                return Err(OobError::Poll {
                    reason: format!("poll returned {status}"),
                });
            }
            _ => {}
        }

        let body: PollBody = response.json().await?;
        let mut interactions = Vec::with_capacity(body.data.len());
        for blob in &body.data {
            match decrypt_interaction(session, blob) {
                Ok(interaction) => interactions.push(interaction),
                Err(e) => tracing::warn!("discarding undecryptable interaction: {e}"),
            }
        }
        Ok(interactions)
    }

    async fn keep_alive(&self, session: &OobSession) -> Result<(), OobError> {
        let response = self
            .client
            .get(format!("{}/keepalive", session.server_url))
            .query(&[("id", session.correlation_id.as_str())])
            .send()
            .await?;
        if response.status().as_u16() == 410 {
            return Err(OobError::Evicted);
        }
        Ok(())
    }

    async fn deregister(&self, session: &OobSession) -> Result<(), OobError> {
        self.client
            .post(format!("{}/deregister", session.server_url))
            .json(&RegisterBody {
                correlation_id: &session.correlation_id,
                secret_key: &session.secret_key,
            })
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encrypt_interaction(session: &OobSession, interaction: &RawInteraction) -> String {
        let cipher = Aes256Gcm::new_from_slice(&session_key(session)).unwrap();
        let nonce = [7u8; NONCE_LEN];
        let plaintext = serde_json::to_vec(interaction).unwrap();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .unwrap();
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        BASE64.encode(blob)
    }

    #[test]
    fn decrypts_what_the_session_key_sealed() {
        let session = OobSession::mint("https://oob.example.test");
        let interaction = RawInteraction {
            protocol: "http".to_string(),
            full_id: format!("{}abc", session.correlation_id),
            remote_address: "203.0.113.9".to_string(),
            timestamp: Utc::now(),
            raw_data: "GET / HTTP/1.1".to_string(),
        };

        let blob = encrypt_interaction(&session, &interaction);
        let decrypted = decrypt_interaction(&session, &blob).unwrap();
        assert_eq!(decrypted.full_id, interaction.full_id);
        assert_eq!(decrypted.protocol, "http");
    }

    #[test]
    fn foreign_key_cannot_open_blob() {
        let session = OobSession::mint("https://oob.example.test");
        let other = OobSession::mint("https://oob.example.test");
        let interaction = RawInteraction {
            protocol: "dns".to_string(),
            full_id: "x".to_string(),
            remote_address: String::new(),
            timestamp: Utc::now(),
            raw_data: String::new(),
        };

        let blob = encrypt_interaction(&session, &interaction);
        assert!(matches!(
            decrypt_interaction(&other, &blob),
            Err(OobError::Decrypt)
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let session = OobSession::mint("https://oob.example.test");
        assert!(decrypt_interaction(&session, "AAAA").is_err());
        assert!(decrypt_interaction(&session, "not base64 !!").is_err());
    }
}
