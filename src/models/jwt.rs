//! Captured JSON Web Tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A JWT observed in traffic, with the claims worth indexing pulled out of
/// the (unverified) payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwt {
    pub id: Uuid,
    pub workspace_id: i32,
    pub token: String,
    pub algorithm: String,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub audience: Option<String>,
    pub tested_embedded_wordlist: bool,
    pub cracked: bool,
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Jwt {
    /// Decode header and payload without verifying the signature. Returns
    /// `None` when the string is not a structurally valid JWT.
    pub fn parse_unverified(workspace_id: i32, token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let header_b64 = parts.next()?;
        let payload_b64 = parts.next()?;
        parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64).ok()?).ok()?;
        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64).ok()?).ok()?;

        let algorithm = header.get("alg")?.as_str()?.to_string();
        let claim = |name: &str| {
            payload
                .get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        Some(Self {
            id: Uuid::new_v4(),
            workspace_id,
            token: token.to_string(),
            algorithm,
            issuer: claim("iss"),
            subject: claim("sub"),
            audience: claim("aud"),
            tested_embedded_wordlist: false,
            cracked: false,
            secret: None,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // {"alg":"HS256","typ":"JWT"} . {"iss":"issuer.test","sub":"alice"} . sig
    const TOKEN: &str = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.eyJpc3MiOiJpc3N1ZXIudGVzdCIsInN1YiI6ImFsaWNlIn0.c2ln";

    #[test]
    fn parses_claims_without_verification() {
        let jwt = Jwt::parse_unverified(1, TOKEN).unwrap();
        assert_eq!(jwt.algorithm, "HS256");
        assert_eq!(jwt.issuer.as_deref(), Some("issuer.test"));
        assert_eq!(jwt.subject.as_deref(), Some("alice"));
        assert_eq!(jwt.audience, None);
        assert!(!jwt.cracked);
    }

    #[test]
    fn rejects_non_jwt_strings() {
        assert!(Jwt::parse_unverified(1, "not-a-token").is_none());
        assert!(Jwt::parse_unverified(1, "a.b").is_none());
        assert!(Jwt::parse_unverified(1, "a.b.c.d").is_none());
    }
}
