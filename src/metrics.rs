//! C15: Metrics Collector — atomic counters, a bounded latency ring, and a
//! periodic snapshot optionally POSTed to a configured webhook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

/// Capacity of the latency sample ring.
const LATENCY_RING_CAPACITY: usize = 1000;

/// Process-wide atomic counters plus a bounded latency sample ring.
///
/// All counters saturate rather than panic on overflow — metrics must never
/// be the reason a request fails.
#[derive(Default)]
pub struct MetricsCollector {
    messages: AtomicU64,
    tokens: AtomicU64,
    agent_runs_total: AtomicU64,
    agent_runs_active: AtomicU64,
    agent_runs_success: AtomicU64,
    agent_runs_failed: AtomicU64,
    agent_runs_timeout: AtomicU64,
    tool_calls_total: AtomicU64,
    tool_calls_success: AtomicU64,
    tool_calls_failed: AtomicU64,
    subagents: AtomicU64,
    errors: AtomicU64,
    sessions: AtomicU64,
    db_queries: AtomicU64,
    db_queries_slow: AtomicU64,
    latencies_ms: Mutex<Vec<u64>>,
}

/// A point-in-time snapshot of all collected metrics, suitable for
/// serialization and webhook delivery.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Messages processed.
    pub messages: u64,
    /// Total tokens consumed across all models.
    pub tokens: u64,
    /// Agent runs started.
    pub agent_runs_total: u64,
    /// Agent runs currently in flight.
    pub agent_runs_active: u64,
    /// Agent runs that completed successfully.
    pub agent_runs_success: u64,
    /// Agent runs that completed with a failure.
    pub agent_runs_failed: u64,
    /// Agent runs that hit a budget/timeout termination.
    pub agent_runs_timeout: u64,
    /// Tool calls dispatched.
    pub tool_calls_total: u64,
    /// Tool calls that returned without error.
    pub tool_calls_success: u64,
    /// Tool calls that returned an error.
    pub tool_calls_failed: u64,
    /// Sub-agent invocations.
    pub subagents: u64,
    /// Errors observed across all components.
    pub errors: u64,
    /// Distinct sessions seen.
    pub sessions: u64,
    /// Database queries executed.
    pub db_queries: u64,
    /// Database queries that exceeded the slow-query threshold.
    pub db_queries_slow: u64,
    /// Average latency across the current ring, in milliseconds.
    pub latency_avg_ms: f64,
    /// 50th percentile latency (nearest-rank), in milliseconds.
    pub latency_p50_ms: u64,
    /// 99th percentile latency (nearest-rank), in milliseconds.
    pub latency_p99_ms: u64,
}

impl MetricsCollector {
    /// Build an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed message.
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Record tokens consumed by a completion.
    pub fn record_tokens(&self, count: u64) {
        self.tokens.fetch_add(count, Ordering::Relaxed);
    }

    /// Mark the start of an agent run.
    pub fn agent_run_start(&self) {
        self.agent_runs_total.fetch_add(1, Ordering::Relaxed);
        self.agent_runs_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the completion of an agent run with its outcome.
    ///
    /// Saturates at zero: calling this without a matching
    /// [`Self::agent_run_start`] does not underflow the active counter.
    pub fn agent_run_complete(&self, outcome: RunOutcome) {
        let _ = self
            .agent_runs_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
        match outcome {
            RunOutcome::Success => self.agent_runs_success.fetch_add(1, Ordering::Relaxed),
            RunOutcome::Failed => self.agent_runs_failed.fetch_add(1, Ordering::Relaxed),
            RunOutcome::Timeout => self.agent_runs_timeout.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a dispatched tool call and its outcome.
    pub fn record_tool_call(&self, success: bool) {
        self.tool_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.tool_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tool_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a sub-agent invocation.
    pub fn record_subagent(&self) {
        self.subagents.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error observed anywhere in the system.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a newly seen session.
    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a database query, flagging it slow when over `threshold`.
    pub fn record_db_query(&self, duration: Duration, threshold: Duration) {
        self.db_queries.fetch_add(1, Ordering::Relaxed);
        if duration >= threshold {
            self.db_queries_slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a latency sample in milliseconds, evicting the oldest sample
    /// once the ring is at capacity.
    pub fn record_latency(&self, millis: u64) {
        let mut ring = self.latencies_ms.lock().expect("latency ring lock");
        if ring.len() >= LATENCY_RING_CAPACITY {
            ring.remove(0);
        }
        ring.push(millis);
    }

    /// Take a consistent snapshot of every counter and the latency ring.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ring = self.latencies_ms.lock().expect("latency ring lock");
        let mut sorted = ring.clone();
        sorted.sort_unstable();
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };

        MetricsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            agent_runs_total: self.agent_runs_total.load(Ordering::Relaxed),
            agent_runs_active: self.agent_runs_active.load(Ordering::Relaxed),
            agent_runs_success: self.agent_runs_success.load(Ordering::Relaxed),
            agent_runs_failed: self.agent_runs_failed.load(Ordering::Relaxed),
            agent_runs_timeout: self.agent_runs_timeout.load(Ordering::Relaxed),
            tool_calls_total: self.tool_calls_total.load(Ordering::Relaxed),
            tool_calls_success: self.tool_calls_success.load(Ordering::Relaxed),
            tool_calls_failed: self.tool_calls_failed.load(Ordering::Relaxed),
            subagents: self.subagents.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            db_queries: self.db_queries.load(Ordering::Relaxed),
            db_queries_slow: self.db_queries_slow.load(Ordering::Relaxed),
            latency_avg_ms: avg,
            latency_p50_ms: nearest_rank(&sorted, 0.50),
            latency_p99_ms: nearest_rank(&sorted, 0.99),
        }
    }

    /// Spawn a background ticker that snapshots every `interval` and, when
    /// `webhook_url` is set, POSTs the snapshot (best-effort, failures are
    /// logged but never propagated).
    pub fn spawn_ticker(
        self: std::sync::Arc<Self>,
        interval: Duration,
        webhook_url: Option<String>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = self.snapshot();
                debug!(messages = snapshot.messages, tokens = snapshot.tokens, "metrics snapshot");
                if let Some(url) = webhook_url.clone() {
                    let client = client.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(Duration::from_secs(10), post_snapshot(&client, &url, &snapshot)).await {
                            Ok(Err(e)) => warn!(error = %e, "metrics webhook delivery failed"),
                            Err(_) => warn!("metrics webhook delivery timed out"),
                            Ok(Ok(())) => {}
                        }
                    });
                }
            }
        })
    }
}

/// Outcome recorded when an agent run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run produced a final reply normally.
    Success,
    /// The run terminated with an unrecoverable error.
    Failed,
    /// The run terminated because a budget or wallclock limit was hit.
    Timeout,
}

/// Nearest-rank percentile over an already-sorted slice.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

async fn post_snapshot(
    client: &reqwest::Client,
    url: &str,
    snapshot: &MetricsSnapshot,
) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(snapshot)
        .timeout(Duration::from_secs(30))
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("metrics webhook returned status {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_run_complete_never_underflows_active_count() {
        let metrics = MetricsCollector::new();
        metrics.agent_run_complete(RunOutcome::Success);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.agent_runs_active, 0);
        assert_eq!(snapshot.agent_runs_success, 1);
    }

    #[test]
    fn agent_run_lifecycle_tracks_active_and_outcome() {
        let metrics = MetricsCollector::new();
        metrics.agent_run_start();
        metrics.agent_run_start();
        metrics.agent_run_complete(RunOutcome::Failed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.agent_runs_total, 2);
        assert_eq!(snapshot.agent_runs_active, 1);
        assert_eq!(snapshot.agent_runs_failed, 1);
    }

    #[test]
    fn latency_ring_evicts_oldest_past_capacity() {
        let metrics = MetricsCollector::new();
        for i in 0..(LATENCY_RING_CAPACITY + 10) {
            metrics.record_latency(i as u64);
        }
        let ring = metrics.latencies_ms.lock().expect("lock should succeed");
        assert_eq!(ring.len(), LATENCY_RING_CAPACITY);
        assert_eq!(ring[0], 10);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(nearest_rank(&sorted, 0.50), 50);
        assert_eq!(nearest_rank(&sorted, 0.99), 99);
    }

    #[test]
    fn tool_call_counts_split_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_tool_call(true);
        metrics.record_tool_call(false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tool_calls_total, 2);
        assert_eq!(snapshot.tool_calls_success, 1);
        assert_eq!(snapshot.tool_calls_failed, 1);
    }
}
