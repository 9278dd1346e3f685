//! Time-based checks: SQL injection and command injection confirmed by
//! induced response delay.
//!
//! A delay only counts when a control request at the same target returned
//! within half of the expected sleep; slow or flaky targets never confirm.

use std::time::Duration;

use async_trait::async_trait;

use crate::checks::{Check, CheckContext, CheckOutput, apply_payload, fetch_baseline};
use crate::error::CheckError;
use crate::executor::{SendOptions, time_based_timeout};
use crate::models::{InsertionPoint, Issue, IssueKind, JobKind};
use crate::payloads::PayloadFamily;

const DEFAULT_FAMILIES: &[PayloadFamily] =
    &[PayloadFamily::SqliTime, PayloadFamily::CmdInjectionTime];

/// The confirmation rule: the probe stalled at least the expected sleep
/// while the control stayed under half of it.
pub(crate) fn delay_confirms(control: Duration, probe: Duration, expected: Duration) -> bool {
    probe >= expected && control < expected / 2
}

pub struct TimingCheck;

fn issue_kind(family: PayloadFamily) -> Option<IssueKind> {
    match family {
        PayloadFamily::SqliTime => Some(IssueKind::SqlInjectionTimeBased),
        PayloadFamily::CmdInjectionTime => Some(IssueKind::CommandInjectionTimeBased),
        _ => None,
    }
}

#[async_trait]
impl Check for TimingCheck {
    fn kind(&self) -> JobKind {
        JobKind::Timing
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutput, CheckError> {
        ctx.ensure_active()?;

        let families: Vec<PayloadFamily> = match ctx.job.payload.family {
            Some(family) if family.is_time_based() => vec![family],
            Some(_) | None => DEFAULT_FAMILIES.to_vec(),
        };
        let point = ctx
            .job
            .target
            .insertion_point
            .unwrap_or(InsertionPoint::UrlParam);

        // Control: the unpayloaded target, timed.
        let control = fetch_baseline(ctx).await?;
        let control_duration = Duration::from_millis(control.duration_ms.max(0) as u64);

        let mut output = CheckOutput::default();
        for family in families {
            for payload in ctx.payloads.generate(family) {
                ctx.ensure_active()?;
                let Some(expected) = payload.expected_sleep else {
                    continue;
                };
                if control_duration >= expected / 2 {
                    tracing::debug!(
                        url = %ctx.job.target.url,
                        ?control_duration,
                        "target too slow for time-based probing"
                    );
                    return Ok(output);
                }

                let mut request = apply_payload(&ctx.job.target, point, &payload.value)?;
                for (name, value) in ctx.scan_headers() {
                    request = request.with_header(name, value);
                }
                let result = ctx
                    .executor
                    .send(
                        request,
                        SendOptions::recorded(ctx.record_options())
                            .with_timeout(time_based_timeout(expected)),
                    )
                    .await;

                if delay_confirms(control_duration, result.duration, expected) {
                    let Some(kind) = issue_kind(family) else {
                        continue;
                    };
                    let mut issue =
                        Issue::from_kind(kind, &ctx.job.target.url, ctx.workspace_id())
                            .with_confidence(75)
                            .with_details(format!(
                                "Payload {:?} delayed the response to {:?} while the \
                                 control returned in {:?} (expected sleep {:?}).",
                                payload.value, result.duration, control_duration, expected
                            ))
                            .with_owner(Some(ctx.scan.id), Some(ctx.job.id));
                    if let Some(history) = &result.history {
                        issue = issue.with_evidence(history.id);
                    }
                    output.issues.push(issue);
                    break;
                }
            }
        }

        Ok(output)
    }
}
