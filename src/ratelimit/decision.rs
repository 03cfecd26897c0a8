//! Admission decision and rate limit header synthesis.

use tracing::debug;

use super::usage::{Evaluation, UsageSnapshot};
use super::window::{Period, WindowAnchors};

/// Status sent with blocked requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Body sent with blocked requests.
pub const BLOCKED_BODY: &[u8] = b"API rate limit exceeded!";

/// Aggregate limit header.
pub const RATELIMIT_LIMIT: &str = "RateLimit-Limit";
/// Aggregate remaining header.
pub const RATELIMIT_REMAINING: &str = "RateLimit-Remaining";
/// Aggregate reset header.
pub const RATELIMIT_RESET: &str = "RateLimit-Reset";
/// Retry hint sent with blocked requests.
pub const RETRY_AFTER: &str = "Retry-After";

/// Ordered response headers.
pub type HeaderSet = Vec<(String, String)>;

/// The window reported in the aggregate headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// Selected period
    pub period: Period,
    /// Its limit
    pub limit: u64,
    /// Its remaining quota as shown to the client
    pub remaining: u64,
    /// Seconds until its window resets
    pub reset: i64,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request; `headers` are attached to the response.
    Allow { headers: Option<HeaderSet> },
    /// Answer with 429 right away.
    Block {
        /// Period without quota left
        period: Period,
        /// Seconds the client should wait
        retry_after: i64,
        /// Full header set of the early response, `Retry-After` included
        headers: HeaderSet,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Remaining quota shown to the client for a snapshot.
///
/// The request under evaluation is counted against the blocking period, or
/// against every period when nothing blocks.
pub fn display_remaining(snapshot: &UsageSnapshot, blocking: Option<Period>) -> u64 {
    let mut remaining = snapshot.remaining;
    if blocking.is_none() || blocking == Some(snapshot.period) {
        remaining -= 1;
    }
    u64::try_from(remaining).unwrap_or(0)
}

/// Pick the window reported in the aggregate headers.
///
/// The smallest display remaining wins; ties go to the longer window. Snapshots
/// are visited in period order so the result never depends on storage order.
pub fn select_binding(evaluation: &Evaluation, anchors: &WindowAnchors) -> Option<Binding> {
    let mut best: Option<Binding> = None;

    for snapshot in &evaluation.snapshots {
        let remaining = display_remaining(snapshot, evaluation.blocking);
        let replace = match &best {
            None => true,
            Some(current) => {
                remaining < current.remaining
                    || (remaining == current.remaining
                        && snapshot.period.span_secs() > current.period.span_secs())
            }
        };

        if replace {
            best = Some(Binding {
                period: snapshot.period,
                limit: snapshot.limit,
                remaining,
                reset: anchors.reset_after(snapshot.period),
            });
        }
    }

    best
}

/// Build the client-visible rate limit headers.
pub fn build_headers(evaluation: &Evaluation, binding: Option<&Binding>) -> HeaderSet {
    let mut headers = HeaderSet::with_capacity(evaluation.snapshots.len() * 2 + 3);

    for snapshot in &evaluation.snapshots {
        let remaining = display_remaining(snapshot, evaluation.blocking);
        headers.push((snapshot.period.limit_header().to_string(), snapshot.limit.to_string()));
        headers.push((snapshot.period.remaining_header().to_string(), remaining.to_string()));
    }

    if let Some(binding) = binding {
        headers.push((RATELIMIT_LIMIT.to_string(), binding.limit.to_string()));
        headers.push((RATELIMIT_REMAINING.to_string(), binding.remaining.to_string()));
        headers.push((RATELIMIT_RESET.to_string(), binding.reset.to_string()));
    }

    headers
}

/// Decide whether a request may proceed and which headers it carries.
pub fn decide(
    evaluation: &Evaluation,
    anchors: &WindowAnchors,
    hide_client_headers: bool,
) -> Decision {
    let binding = select_binding(evaluation, anchors);
    let headers = (!hide_client_headers).then(|| build_headers(evaluation, binding.as_ref()));

    if let Some(binding) = &binding {
        debug!(
            period = %binding.period,
            limit = binding.limit,
            remaining = binding.remaining,
            reset = binding.reset,
            "Selected binding window"
        );
    }

    match evaluation.blocking {
        Some(period) => {
            let retry_after = binding
                .map(|b| b.reset)
                .unwrap_or_else(|| anchors.reset_after(period));
            let mut headers = headers.unwrap_or_default();
            headers.push((RETRY_AFTER.to_string(), retry_after.to_string()));
            Decision::Block {
                period,
                retry_after,
                headers,
            }
        }
        None => Decision::Allow { headers },
    }
}
