//! Per-backend telemetry accumulator.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Telemetry extracted from one backend instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub time_to_first_token_s: f64,
    pub tokens_per_second: f64,
    /// Ordered inter-token decode intervals, in seconds.
    #[serde(default)]
    pub decode_token_times: Vec<f64>,
}

impl TelemetryRecord {
    pub fn reset(&mut self) {
        *self = TelemetryRecord::default();
    }

    /// Fold another record in, keeping request counters cumulative and
    /// rate-style fields at their latest value.
    pub fn accumulate(&mut self, other: &TelemetryRecord) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if other.time_to_first_token_s > 0.0 {
            self.time_to_first_token_s = other.time_to_first_token_s;
        }
        if other.tokens_per_second > 0.0 {
            self.tokens_per_second = other.tokens_per_second;
        }
        if !other.decode_token_times.is_empty() {
            self.decode_token_times = other.decode_token_times.clone();
        }
    }
}

/// Thread-safe telemetry handle shared between a backend instance and the
/// router. The streaming proxy appends from its completion callback while
/// `/stats` reads concurrently.
#[derive(Debug, Clone, Default)]
pub struct SharedTelemetry {
    inner: Arc<Mutex<TelemetryRecord>>,
}

impl SharedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, update: &TelemetryRecord) {
        self.inner.lock().accumulate(update);
    }

    pub fn replace(&self, record: TelemetryRecord) {
        *self.inner.lock() = record;
    }

    pub fn snapshot(&self) -> TelemetryRecord {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_keeps_counters_cumulative() {
        let telemetry = SharedTelemetry::new();
        telemetry.record(&TelemetryRecord {
            input_tokens: 10,
            output_tokens: 20,
            time_to_first_token_s: 0.5,
            tokens_per_second: 40.0,
            decode_token_times: vec![0.025, 0.025],
        });
        telemetry.record(&TelemetryRecord {
            input_tokens: 5,
            output_tokens: 7,
            time_to_first_token_s: 0.3,
            tokens_per_second: 35.0,
            decode_token_times: vec![0.03],
        });

        let snap = telemetry.snapshot();
        assert_eq!(snap.input_tokens, 15);
        assert_eq!(snap.output_tokens, 27);
        assert!((snap.time_to_first_token_s - 0.3).abs() < f64::EPSILON);
        assert_eq!(snap.decode_token_times, vec![0.03]);
    }
}
