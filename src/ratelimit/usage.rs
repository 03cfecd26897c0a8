//! Per-period usage evaluation.

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::RateLimitingConfig;

use super::host::Scope;
use super::identifier::Identifier;
use super::store::{CounterClient, CounterKey, CounterSnapshot, StoreError};
use super::window::{Period, WindowAnchors};

/// Usage of one enabled period at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// The period
    pub period: Period,
    /// Configured limit
    pub limit: u64,
    /// Hits recorded in the current window
    pub usage: u64,
    /// `limit - usage`, negative when the window is overdrawn
    pub remaining: i64,
    /// Counter state to increment from
    pub counter: CounterSnapshot,
    /// Where the counter lives
    pub key: CounterKey,
}

/// Usage of every enabled period for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Snapshots in period order
    pub snapshots: Vec<UsageSnapshot>,
    /// First period found with no quota left
    pub blocking: Option<Period>,
}

/// Usage could not be read for a period.
#[derive(Debug, Error)]
#[error("failed to read usage for period {period}: {source}")]
pub struct UsageError {
    /// Period whose counter could not be read
    pub period: Period,
    /// Snapshots gathered before the failure
    pub partial: Evaluation,
    /// Underlying store failure
    #[source]
    pub source: StoreError,
}

/// Read current usage for every enabled period of `config`.
///
/// Unlimited periods are never read. Every enabled period is read even after
/// a blocking one is found, so that headers cover all of them.
pub async fn evaluate(
    config: &RateLimitingConfig,
    client: &CounterClient,
    scope: &Scope,
    identifier: &Identifier,
    anchors: &WindowAnchors,
) -> Result<Evaluation, UsageError> {
    let mut evaluation = Evaluation::default();

    for (period, limit) in config.enabled_periods() {
        let key = CounterKey::new(scope, identifier, period, anchors.anchor(period));

        let counter = match client.read(&key).await {
            Ok(counter) => counter,
            Err(source) => {
                return Err(UsageError {
                    period,
                    partial: evaluation,
                    source,
                })
            }
        };

        let remaining = saturating_remaining(limit, counter.usage);
        trace!(
            identifier = %identifier,
            period = %period,
            limit,
            usage = counter.usage,
            remaining,
            "Evaluated period usage"
        );

        if remaining <= 0 && evaluation.blocking.is_none() {
            debug!(identifier = %identifier, period = %period, limit, "Quota exhausted");
            evaluation.blocking = Some(period);
        }

        evaluation.snapshots.push(UsageSnapshot {
            period,
            limit,
            usage: counter.usage,
            remaining,
            counter,
            key,
        });
    }

    Ok(evaluation)
}

fn saturating_remaining(limit: u64, usage: u64) -> i64 {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let usage = i64::try_from(usage).unwrap_or(i64::MAX);
    limit.saturating_sub(usage)
}
