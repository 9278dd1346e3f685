//! Passive checks: judge a recorded exchange without probing further.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::checks::{Check, CheckContext, CheckOutput, fetch_baseline};
use crate::error::CheckError;
use crate::models::{History, Issue, IssueKind, JobKind, Jwt};

/// Flags missing hardening headers and chatty server banners.
pub struct PassiveHeaderCheck;

#[async_trait]
impl Check for PassiveHeaderCheck {
    fn kind(&self) -> JobKind {
        JobKind::PassiveHeaders
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
        ctx.ensure_active()?;
        let history = fetch_baseline(ctx).await?;

        let mut output = CheckOutput::default();
        let mut raise = |kind: IssueKind, confidence: u8, details: String| {
            output.issues.push(
                Issue::from_kind(kind, &history.url, ctx.workspace_id())
                    .with_confidence(confidence)
                    .with_details(details)
                    .with_evidence(history.id)
                    .with_owner(Some(ctx.scan.id), Some(ctx.job.id)),
            );
        };

        let is_html = history
            .response_content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("html"));

        if is_html && history.response_header("content-security-policy").is_none() {
            raise(
                IssueKind::MissingContentSecurityPolicy,
                90,
                "The response serves HTML without a Content-Security-Policy header."
                    .to_string(),
            );
        }
        if is_html && history.response_header("x-frame-options").is_none() {
            raise(
                IssueKind::MissingFrameOptions,
                80,
                "The response serves HTML without an X-Frame-Options header.".to_string(),
            );
        }
        if history.url.starts_with("https://")
            && history
                .response_header("strict-transport-security")
                .is_none()
        {
            raise(
                IssueKind::MissingStrictTransportSecurity,
                90,
                "The HTTPS response lacks a Strict-Transport-Security header.".to_string(),
            );
        }
        if let Some(server) = history.response_header("server") {
            if banner_regex().is_match(&server) {
                raise(
                    IssueKind::ServerBannerDisclosure,
                    95,
                    format!("The Server header discloses a version: {server}"),
                );
            }
        }

        Ok(output)
    }
}

fn banner_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[\w-]+/\d[\d.]*").expect("static regex"))
}

/// Captures JSON Web Tokens seen anywhere in the exchange and flags the
/// exposed ones.
pub struct JwtCaptureCheck;

fn jwt_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"eyJ[A-Za-z0-9_-]{6,}\.[A-Za-z0-9_-]{6,}\.[A-Za-z0-9_-]+")
            .expect("static regex")
    })
}

#[async_trait]
impl Check for JwtCaptureCheck {
    fn kind(&self) -> JobKind {
        JobKind::JwtCapture
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
        ctx.ensure_active()?;
        let history = fetch_baseline(ctx).await?;

        let mut output = CheckOutput::default();
        let mut seen = std::collections::HashSet::new();

        for (token, location) in find_tokens(&history) {
            if !seen.insert(token.clone()) {
                continue;
            }
            let Some(jwt) = Jwt::parse_unverified(ctx.workspace_id(), &token) else {
                continue;
            };
            ctx.store.save_jwt(&jwt).await?;
            tracing::debug!(algorithm = %jwt.algorithm, %location, "captured jwt");

            let kind = match location {
                TokenLocation::Url => Some(IssueKind::JwtInUrl),
                TokenLocation::ResponseBody => Some(IssueKind::ExposedJwt),
                TokenLocation::RequestHeaders => None,
            };
            if let Some(kind) = kind {
                output.issues.push(
                    Issue::from_kind(kind, &history.url, ctx.workspace_id())
                        .with_confidence(90)
                        .with_details(format!(
                            "A JSON Web Token (algorithm {}) was observed in the {location}.",
                            jwt.algorithm
                        ))
                        .with_evidence(history.id)
                        .with_owner(Some(ctx.scan.id), Some(ctx.job.id)),
                );
            }
        }

        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenLocation {
    Url,
    RequestHeaders,
    ResponseBody,
}

impl std::fmt::Display for TokenLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TokenLocation::Url => "URL",
            TokenLocation::RequestHeaders => "request headers",
            TokenLocation::ResponseBody => "response body",
        })
    }
}

fn find_tokens(history: &History) -> Vec<(String, TokenLocation)> {
    let mut tokens = Vec::new();
    for m in jwt_regex().find_iter(&history.url) {
        tokens.push((m.as_str().to_string(), TokenLocation::Url));
    }
    let request = String::from_utf8_lossy(&history.raw_request);
    for m in jwt_regex().find_iter(&request) {
        tokens.push((m.as_str().to_string(), TokenLocation::RequestHeaders));
    }
    let body = String::from_utf8_lossy(history.response_body());
    for m in jwt_regex().find_iter(&body) {
        tokens.push((m.as_str().to_string(), TokenLocation::ResponseBody));
    }
    tokens
}
