//! Tool-call loop detection (C4): catches an agent repeating the same (or
//! alternating) tool call instead of making progress.
//!
//! A fixed-size ring buffer of call fingerprints (tool name + canonicalized
//! arguments) is kept per run. Repetition escalates through four severities;
//! [`Severity::Breaker`] should cause the caller to abort the run.

use std::collections::VecDeque;

/// How much a repeated call escalates the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// No repetition detected.
    None,
    /// The same call has repeated a handful of times.
    Warning,
    /// The same call (or an A/B ping-pong) has repeated many times.
    Critical,
    /// The loop breaker should trip — stop the run.
    Breaker,
}

/// Ring-buffer-backed loop detector for a single run.
pub struct LoopDetector {
    history: VecDeque<String>,
    capacity: usize,
    warning_threshold: usize,
    critical_threshold: usize,
    breaker_threshold: usize,
}

impl LoopDetector {
    /// Build a detector with default thresholds (warning at 3 repeats,
    /// critical at 5, breaker at 8) over a ring buffer of the last 16 calls.
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(16),
            capacity: 16,
            warning_threshold: 3,
            critical_threshold: 5,
            breaker_threshold: 8,
        }
    }

    /// Record a tool call and return the resulting severity.
    ///
    /// `tool` and `arguments_json` are combined into a single fingerprint;
    /// arguments should already be in a canonical (e.g. sorted-key JSON)
    /// form so semantically identical calls fingerprint identically.
    pub fn record(&mut self, tool: &str, arguments_json: &str) -> Severity {
        let fingerprint = format!("{tool}:{arguments_json}");

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(fingerprint.clone());

        let repeats = self.history.iter().filter(|f| **f == fingerprint).count();
        let ping_pong = self.detect_ping_pong();

        let repeat_severity = if repeats >= self.breaker_threshold {
            Severity::Breaker
        } else if repeats >= self.critical_threshold {
            Severity::Critical
        } else if repeats >= self.warning_threshold {
            Severity::Warning
        } else {
            Severity::None
        };

        repeat_severity.max(ping_pong)
    }

    /// Detect A,B,A,B,... alternation over the last 8 calls.
    fn detect_ping_pong(&self) -> Severity {
        let recent: Vec<&String> = self.history.iter().rev().take(8).collect();
        if recent.len() < 6 {
            return Severity::None;
        }

        let alternates = recent
            .windows(2)
            .all(|pair| pair[0] != pair[1])
            && recent
                .windows(4)
                .all(|quad| quad[0] == quad[2] && quad[1] == quad[3]);

        if alternates {
            Severity::Critical
        } else {
            Severity::None
        }
    }

    /// Reset all history, e.g. at the start of a new run.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_calls_never_escalate() {
        let mut detector = LoopDetector::new();
        for i in 0..10 {
            let severity = detector.record("read_file", &format!("{{\"path\":\"f{i}.txt\"}}"));
            assert_eq!(severity, Severity::None);
        }
    }

    #[test]
    fn identical_repeats_escalate_through_thresholds() {
        let mut detector = LoopDetector::new();
        let mut last = Severity::None;
        for _ in 0..9 {
            last = detector.record("list_dir", "{}");
        }
        assert_eq!(last, Severity::Breaker);
    }

    #[test]
    fn warning_then_critical_ordering() {
        let mut detector = LoopDetector::new();
        let mut severities = Vec::new();
        for _ in 0..6 {
            severities.push(detector.record("ping", "{}"));
        }
        assert_eq!(severities[2], Severity::Warning);
        assert_eq!(severities[4], Severity::Critical);
    }

    #[test]
    fn ping_pong_alternation_is_detected() {
        let mut detector = LoopDetector::new();
        let mut last = Severity::None;
        for i in 0..8 {
            let tool = if i % 2 == 0 { "tool_a" } else { "tool_b" };
            last = detector.record(tool, "{}");
        }
        assert_eq!(last, Severity::Critical);
    }

    #[test]
    fn reset_clears_history() {
        let mut detector = LoopDetector::new();
        for _ in 0..5 {
            detector.record("x", "{}");
        }
        detector.reset();
        assert_eq!(detector.record("x", "{}"), Severity::None);
    }
}
