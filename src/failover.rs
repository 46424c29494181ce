//! C5: Model Failover + Usage Tracker.
//!
//! Picks the model that serves a given call (primary, then fallbacks, then
//! the primary again as a last resort), classifies provider failures into a
//! cooldown, and tracks per-model token/cost usage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::ModelsConfig;
use crate::db::Store;
use crate::providers::ProviderError;

/// Classification of a provider failure, driving the cooldown computed for
/// the model that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Account billing/payment issue (HTTP 402 or billing-pattern message).
    Billing,
    /// Rate limited (HTTP 429).
    RateLimit,
    /// Authentication/authorization failure (HTTP 401/403).
    Auth,
    /// Request timed out (HTTP 408 or timeout-pattern message).
    Timeout,
    /// Malformed request (HTTP 400).
    Format,
    /// Upstream server error (HTTP ≥500).
    Server,
    /// Unclassified.
    Unknown,
}

/// Classify a provider error by HTTP status (when known) and message text.
///
/// # Errors
///
/// None — this is a pure classifier, never fails.
pub fn classify_error(status: Option<u16>, message: &str) -> FailureClass {
    if let Some(status) = status {
        match status {
            402 => return FailureClass::Billing,
            429 => return FailureClass::RateLimit,
            401 | 403 => return FailureClass::Auth,
            408 => return FailureClass::Timeout,
            400 => return FailureClass::Format,
            s if s >= 500 => return FailureClass::Server,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("empty chunks")
        || lower.contains("ended without sending any chunks")
    {
        FailureClass::Timeout
    } else if lower.contains("billing") || lower.contains("payment") {
        FailureClass::Billing
    } else if lower.contains("rate limit") {
        FailureClass::RateLimit
    } else {
        FailureClass::Unknown
    }
}

/// Classify a [`ProviderError`] directly, extracting status/message.
pub fn classify_provider_error(err: &ProviderError) -> FailureClass {
    match err {
        ProviderError::HttpStatus { status, body } => classify_error(Some(*status), body),
        other => classify_error(None, &other.to_string()),
    }
}

/// Backoff tuning knobs for cooldown computation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Billing cooldown length, in hours.
    pub billing_hours: i64,
    /// Cap on billing cooldown length, in hours.
    pub billing_max_hours: i64,
    /// Initial rate-limit/timeout/server backoff, in minutes.
    pub initial_backoff_minutes: i64,
    /// Cap on rate-limit backoff, in minutes.
    pub rate_limit_max_minutes: i64,
    /// Cap on timeout/server backoff, in minutes.
    pub timeout_max_minutes: i64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            billing_hours: 6,
            billing_max_hours: 24,
            initial_backoff_minutes: 1,
            rate_limit_max_minutes: 30,
            timeout_max_minutes: 30,
        }
    }
}

/// Compute the cooldown duration for the `n`th consecutive failure
/// (`error_count`, 1-indexed) of `class`.
#[must_use]
#[allow(clippy::arithmetic_side_effects, clippy::cast_sign_loss)]
pub fn cooldown_duration(class: FailureClass, error_count: u32, backoff: BackoffConfig) -> Duration {
    let minutes = match class {
        FailureClass::Billing => {
            let hours = backoff.billing_hours.min(backoff.billing_max_hours).max(0);
            return Duration::from_secs(hours as u64 * 3600);
        }
        FailureClass::RateLimit => {
            let exp = backoff
                .initial_backoff_minutes
                .saturating_mul(5i64.saturating_pow(error_count.saturating_sub(1)));
            exp.min(backoff.rate_limit_max_minutes)
        }
        FailureClass::Auth => 60,
        FailureClass::Timeout | FailureClass::Server => {
            let exp = backoff
                .initial_backoff_minutes
                .saturating_mul(2i64.saturating_pow(error_count.saturating_sub(1)));
            exp.min(backoff.timeout_max_minutes)
        }
        FailureClass::Format | FailureClass::Unknown => 1,
    };
    Duration::from_secs(minutes.max(0) as u64 * 60)
}

/// Errors from failover/usage operations.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
}

/// Selects the serving model and tracks cooldowns + usage across calls.
pub struct ModelFailover {
    store: Arc<Store>,
    primary: String,
    fallbacks: Vec<String>,
    backoff: BackoffConfig,
}

impl ModelFailover {
    /// Build a failover manager from configuration.
    pub fn new(config: &ModelsConfig, store: Arc<Store>) -> Self {
        Self {
            store,
            primary: config.primary.clone(),
            fallbacks: config.fallbacks.clone(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Returns the model that should serve the next call: the primary if it
    /// is not in cooldown, else the first non-cooling fallback, else the
    /// primary anyway as a best-effort last resort.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn select_model(&self) -> Result<String, FailoverError> {
        if !self.in_cooldown(&self.primary)? {
            return Ok(self.primary.clone());
        }
        for candidate in &self.fallbacks {
            if !self.in_cooldown(candidate)? {
                return Ok(candidate.clone());
            }
        }
        warn!(model = %self.primary, "all models cooling down, using primary as last resort");
        Ok(self.primary.clone())
    }

    /// Returns `true` when the primary and every configured fallback are
    /// currently cooling down, i.e. [`ModelFailover::select_model`] would
    /// return the primary only as a best-effort last resort.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn all_models_cooling(&self) -> Result<bool, FailoverError> {
        if !self.in_cooldown(&self.primary)? {
            return Ok(false);
        }
        for candidate in &self.fallbacks {
            if !self.in_cooldown(candidate)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn in_cooldown(&self, model: &str) -> Result<bool, FailoverError> {
        self.gc_expired(model)?;
        let until: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT until FROM model_cooldowns WHERE model = ?1",
                rusqlite::params![model],
                |row| row.get(0),
            )
            .ok()
        })?;
        Ok(until.is_some())
    }

    fn gc_expired(&self, model: &str) -> Result<(), FailoverError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM model_cooldowns WHERE model = ?1 AND until <= ?2",
                rusqlite::params![model, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Record a failure for `model`, computing and persisting its cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn report_failure(
        &self,
        model: &str,
        class: FailureClass,
        message: &str,
    ) -> Result<DateTime<Utc>, FailoverError> {
        let error_count: u32 = self
            .store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT reason FROM model_cooldowns WHERE model = ?1",
                    rusqlite::params![model],
                    |row| row.get::<_, String>(0),
                )
                .ok()
            })?
            .and_then(|reason| reason.rsplit(':').next().and_then(|n| n.parse::<u32>().ok()))
            .unwrap_or(0)
            .saturating_add(1);

        let duration = cooldown_duration(class, error_count, self.backoff);
        let until = Utc::now()
            .checked_add_signed(chrono::Duration::from_std(duration).unwrap_or_default())
            .unwrap_or_else(Utc::now);
        let reason = format!("{class:?}:{error_count}");

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO model_cooldowns (model, until, reason) VALUES (?1, ?2, ?3)
                 ON CONFLICT(model) DO UPDATE SET until = excluded.until, reason = excluded.reason",
                rusqlite::params![model, until.to_rfc3339(), reason],
            )?;
            Ok(())
        })?;
        warn!(model, ?class, %message, until = %until, "model entering cooldown");
        Ok(until)
    }

    /// Clear any cooldown for `model` after a successful call.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn report_success(&self, model: &str) -> Result<(), FailoverError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM model_cooldowns WHERE model = ?1",
                rusqlite::params![model],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Record token usage and cost for a completed call, attributed to
    /// `session_key` (spec §4.5: usage is tracked per (sessionID, model)).
    /// Global per-model totals ([`ModelFailover::usage_totals`]) mirror the
    /// sum of every session's rows for that model.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn record_usage(
        &self,
        session_key: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<(), FailoverError> {
        let cost_usd_e6 = estimate_cost_e6(model, input_tokens, output_tokens);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_log (session_key, model, input_tokens, output_tokens, cost_usd_e6, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session_key,
                    model,
                    input_tokens,
                    output_tokens,
                    cost_usd_e6,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        info!(session = session_key, model, input_tokens, output_tokens, cost_usd_e6, "usage recorded");
        Ok(())
    }

    /// Sum total (input_tokens, output_tokens, cost_usd_e6) recorded for
    /// `model` across every session. Mirrors the sum of
    /// [`ModelFailover::session_usage_totals`] over all sessions that used
    /// `model`.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn usage_totals(&self, model: &str) -> Result<(i64, i64, i64), FailoverError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0), COALESCE(SUM(cost_usd_e6),0)
                 FROM usage_log WHERE model = ?1",
                rusqlite::params![model],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
        })?;
        Ok(row)
    }

    /// Sum total (input_tokens, output_tokens, cost_usd_e6) recorded for the
    /// single (`session_key`, `model`) pair — the per-session accounting
    /// spec §4.5 requires alongside the global per-model totals.
    ///
    /// # Errors
    ///
    /// Returns [`FailoverError`] on database failure.
    pub fn session_usage_totals(
        &self,
        session_key: &str,
        model: &str,
    ) -> Result<(i64, i64, i64), FailoverError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0), COALESCE(SUM(cost_usd_e6),0)
                 FROM usage_log WHERE session_key = ?1 AND model = ?2",
                rusqlite::params![session_key, model],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
        })?;
        Ok(row)
    }
}

/// Per-1M-token cost table, in USD micros (1e6 == $1.00), keyed by model
/// prefix. Longest matching prefix wins.
fn cost_table() -> &'static [(&'static str, u64, u64)] {
    &[
        ("anthropic/claude-opus", 15_000_000, 75_000_000),
        ("anthropic/claude-sonnet", 3_000_000, 15_000_000),
        ("anthropic/claude-haiku", 800_000, 4_000_000),
        ("openai/gpt-4o", 2_500_000, 10_000_000),
        ("openai/gpt-4o-mini", 150_000, 600_000),
        ("ollama/", 0, 0),
    ]
}

/// Estimate cost in USD micros for `input_tokens`/`output_tokens` served by
/// `model`, using the longest matching prefix in the cost table, falling
/// back to zero for unknown models.
#[must_use]
pub fn estimate_cost_e6(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    let mut best: Option<(&str, u64, u64)> = None;
    for &(prefix, input_per_1m, output_per_1m) in cost_table() {
        if model.starts_with(prefix) {
            let better = match best {
                Some((b, _, _)) => prefix.len() > b.len(),
                None => true,
            };
            if better {
                best = Some((prefix, input_per_1m, output_per_1m));
            }
        }
    }
    let Some((_, input_per_1m, output_per_1m)) = best else {
        return 0;
    };
    let input_cost = u64::from(input_tokens).saturating_mul(input_per_1m) / 1_000_000;
    let output_cost = u64::from(output_tokens).saturating_mul(output_per_1m) / 1_000_000;
    input_cost.saturating_add(output_cost).try_into().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failover() -> ModelFailover {
        let config = ModelsConfig {
            primary: "anthropic/claude-sonnet-4".to_owned(),
            fallbacks: vec!["anthropic/claude-haiku".to_owned()],
        };
        ModelFailover::new(&config, Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")))
    }

    #[test]
    fn classify_maps_http_statuses() {
        assert_eq!(classify_error(Some(402), ""), FailureClass::Billing);
        assert_eq!(classify_error(Some(429), ""), FailureClass::RateLimit);
        assert_eq!(classify_error(Some(401), ""), FailureClass::Auth);
        assert_eq!(classify_error(Some(408), ""), FailureClass::Timeout);
        assert_eq!(classify_error(Some(400), ""), FailureClass::Format);
        assert_eq!(classify_error(Some(503), ""), FailureClass::Server);
    }

    #[test]
    fn classify_falls_back_to_message_heuristics() {
        assert_eq!(classify_error(None, "request timed out"), FailureClass::Timeout);
        assert_eq!(classify_error(None, "billing issue"), FailureClass::Billing);
        assert_eq!(classify_error(None, "rate limit exceeded"), FailureClass::RateLimit);
        assert_eq!(classify_error(None, "something odd"), FailureClass::Unknown);
    }

    #[test]
    fn rate_limit_backoff_grows_exponentially_and_caps() {
        let backoff = BackoffConfig::default();
        let first = cooldown_duration(FailureClass::RateLimit, 1, backoff);
        let second = cooldown_duration(FailureClass::RateLimit, 2, backoff);
        assert!(second > first);
        let capped = cooldown_duration(FailureClass::RateLimit, 20, backoff);
        assert_eq!(capped, Duration::from_secs(backoff.rate_limit_max_minutes as u64 * 60));
    }

    #[test]
    fn select_model_prefers_primary_when_healthy() {
        let failover = failover();
        assert_eq!(failover.select_model().expect("select_model should succeed"), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn select_model_falls_back_when_primary_cools_down() {
        let failover = failover();
        failover
            .report_failure("anthropic/claude-sonnet-4", FailureClass::RateLimit, "429")
            .expect("report_failure should succeed");
        assert_eq!(failover.select_model().expect("select_model should succeed"), "anthropic/claude-haiku");
    }

    #[test]
    fn select_model_uses_primary_as_last_resort_when_all_cooling() {
        let failover = failover();
        failover
            .report_failure("anthropic/claude-sonnet-4", FailureClass::Auth, "403")
            .expect("report_failure should succeed");
        failover
            .report_failure("anthropic/claude-haiku", FailureClass::Auth, "403")
            .expect("report_failure should succeed");
        assert_eq!(failover.select_model().expect("select_model should succeed"), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn report_success_clears_cooldown() {
        let failover = failover();
        failover
            .report_failure("anthropic/claude-sonnet-4", FailureClass::RateLimit, "429")
            .expect("report_failure should succeed");
        failover.report_success("anthropic/claude-sonnet-4").expect("report_success should succeed");
        assert_eq!(failover.select_model().expect("select_model should succeed"), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn usage_totals_accumulate() {
        let failover = failover();
        failover
            .record_usage("telegram:alice", "anthropic/claude-sonnet-4", 1000, 500)
            .expect("record_usage should succeed");
        failover
            .record_usage("telegram:bob", "anthropic/claude-sonnet-4", 2000, 1000)
            .expect("record_usage should succeed");
        let (input, output, _cost) = failover.usage_totals("anthropic/claude-sonnet-4").expect("usage_totals should succeed");
        assert_eq!(input, 3000);
        assert_eq!(output, 1500);
    }

    #[test]
    fn session_usage_totals_isolate_one_session_and_mirror_into_the_global_total() {
        let failover = failover();
        failover
            .record_usage("telegram:alice", "anthropic/claude-sonnet-4", 1000, 500)
            .expect("record_usage should succeed");
        failover
            .record_usage("telegram:bob", "anthropic/claude-sonnet-4", 2000, 1000)
            .expect("record_usage should succeed");

        let (alice_input, alice_output, _) = failover
            .session_usage_totals("telegram:alice", "anthropic/claude-sonnet-4")
            .expect("session_usage_totals should succeed");
        assert_eq!(alice_input, 1000);
        assert_eq!(alice_output, 500);

        let (bob_input, bob_output, _) = failover
            .session_usage_totals("telegram:bob", "anthropic/claude-sonnet-4")
            .expect("session_usage_totals should succeed");
        assert_eq!(bob_input, 2000);
        assert_eq!(bob_output, 1000);

        let (global_input, global_output, _) = failover
            .usage_totals("anthropic/claude-sonnet-4")
            .expect("usage_totals should succeed");
        assert_eq!(global_input, alice_input + bob_input);
        assert_eq!(global_output, alice_output + bob_output);
    }

    #[test]
    fn cost_estimate_uses_longest_matching_prefix() {
        let haiku_cost = estimate_cost_e6("anthropic/claude-haiku", 1_000_000, 0);
        let sonnet_cost = estimate_cost_e6("anthropic/claude-sonnet-4", 1_000_000, 0);
        assert!(haiku_cost < sonnet_cost);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(estimate_cost_e6("mystery/model", 1000, 1000), 0);
    }
}
