//! Streaming proxy.
//!
//! Relays a backend's response stream to the client byte-for-byte while
//! sniffing telemetry out of the SSE frames. Chunks are forwarded the moment
//! they arrive; parsing happens on a rolling line buffer on the side. When
//! the backend closes without a `data: [DONE]` frame the proxy appends one
//! itself, so every successful SSE stream the client sees is well
//! terminated.

use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use lemonade_client::HttpClient;
use lemonade_core::telemetry::TelemetryRecord;
use lemonade_core::{Error, Result};

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// How the proxied response is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Server-sent events with telemetry sniffing and DONE-sentinel repair.
    Sse,
    /// Opaque byte relay (TTS audio and similar).
    Raw,
}

/// Forward a streaming POST to `url`, writing every received chunk to `tx`.
///
/// Returns the backend's HTTP status. A closed receiver (client
/// disconnected) ends the relay early without error; the dropped response
/// aborts the upstream transfer. `on_complete` fires with the extracted
/// telemetry after a successful SSE stream.
pub async fn forward_streaming_request(
    client: &HttpClient,
    url: &str,
    request_body: String,
    mode: StreamMode,
    tx: mpsc::Sender<Bytes>,
    on_complete: Option<Box<dyn FnOnce(TelemetryRecord) + Send>>,
) -> Result<u16> {
    // Streaming generation is open-ended; no read timeout.
    let response = client.post_stream_response(url, request_body, None).await?;
    let status = response.status().as_u16();

    if status != 200 {
        let body = response
            .text()
            .await
            .map_err(|e| Error::network(e.to_string()))?;
        return Err(Error::backend("backend returned error", status, body));
    }

    let mut sniffer = SseSniffer::new();
    let mut stream = response.bytes_stream();
    let mut client_gone = false;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) if e.is_body() || e.is_decode() => {
                // Backends drop the connection after the last chunk.
                tracing::debug!("backend stream ended: {e}");
                break;
            }
            Err(e) => return Err(Error::network(e.to_string())),
        };

        if mode == StreamMode::Sse {
            sniffer.observe(&chunk);
        }

        if tx.send(chunk).await.is_err() {
            tracing::info!("client disconnected mid-stream, aborting backend transfer");
            client_gone = true;
            break;
        }
    }

    if mode == StreamMode::Sse && !client_gone {
        if !sniffer.saw_done {
            tracing::warn!("backend closed the stream without [DONE]; appending it");
            let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
        }
        let telemetry = sniffer.into_telemetry();
        if let Some(on_complete) = on_complete {
            on_complete(telemetry);
        }
    }

    Ok(status)
}

/// Incremental SSE telemetry parser over a rolling line buffer.
struct SseSniffer {
    line_buffer: String,
    saw_done: bool,
    /// Last frame carrying `usage` or `timings`.
    final_stats: Option<Value>,
    /// Wall-clock intervals between token-bearing frames.
    measured_decode_times: Vec<f64>,
    last_token_at: Option<Instant>,
}

impl SseSniffer {
    fn new() -> Self {
        Self {
            line_buffer: String::new(),
            saw_done: false,
            final_stats: None,
            measured_decode_times: Vec::new(),
            last_token_at: None,
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            self.observe_line(line.trim_end());
        }
    }

    fn observe_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data: ") else {
            return;
        };
        if payload == "[DONE]" {
            self.saw_done = true;
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(payload) else {
            return;
        };

        if frame_has_token(&frame) {
            let now = Instant::now();
            if let Some(last) = self.last_token_at {
                self.measured_decode_times
                    .push(now.duration_since(last).as_secs_f64());
            }
            self.last_token_at = Some(now);
        }

        if frame.get("usage").is_some() || frame.get("timings").is_some() {
            self.final_stats = Some(frame);
        }
    }

    /// Resolve telemetry with the source precedence: backend-reported
    /// per-token latencies, then a backend-reported average spread across
    /// the token count, then our own wall-clock measurements.
    fn into_telemetry(self) -> TelemetryRecord {
        let mut telemetry = TelemetryRecord::default();

        if let Some(stats) = &self.final_stats {
            extract_final_stats(stats, &mut telemetry);
        }
        if telemetry.decode_token_times.is_empty() {
            telemetry.decode_token_times = self.measured_decode_times;
        }
        telemetry
    }
}

fn frame_has_token(frame: &Value) -> bool {
    let Some(delta) = frame
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
    else {
        return false;
    };
    for key in ["content", "reasoning_content"] {
        if let Some(text) = delta.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return true;
            }
        }
    }
    false
}

fn extract_final_stats(frame: &Value, telemetry: &mut TelemetryRecord) {
    if let Some(usage) = frame.get("usage") {
        if let Some(v) = usage.get("prompt_tokens").and_then(Value::as_u64) {
            telemetry.input_tokens = v;
        }
        if let Some(v) = usage.get("completion_tokens").and_then(Value::as_u64) {
            telemetry.output_tokens = v;
        }
        // FLM reports prefill/decode stats inside usage.
        if let Some(v) = usage.get("prefill_duration_ttft").and_then(Value::as_f64) {
            telemetry.time_to_first_token_s = v;
        }
        if let Some(v) = usage.get("decoding_speed_tps").and_then(Value::as_f64) {
            telemetry.tokens_per_second = v;
        }
        if let Some(times) = usage.get("decode_token_times").and_then(Value::as_array) {
            telemetry.decode_token_times =
                times.iter().filter_map(Value::as_f64).collect();
        }
    }

    // llama.cpp reports a `timings` object instead.
    if let Some(timings) = frame.get("timings") {
        if let Some(v) = timings.get("prompt_n").and_then(Value::as_u64) {
            telemetry.input_tokens = v;
        }
        if let Some(v) = timings.get("predicted_n").and_then(Value::as_u64) {
            telemetry.output_tokens = v;
        }
        if let Some(v) = timings.get("prompt_ms").and_then(Value::as_f64) {
            telemetry.time_to_first_token_s = v / 1000.0;
        }
        if let Some(v) = timings.get("predicted_per_second").and_then(Value::as_f64) {
            telemetry.tokens_per_second = v;
        }

        match timings.get("predicted_ms") {
            Some(Value::Array(per_token)) => {
                telemetry.decode_token_times = per_token
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|ms| ms / 1000.0)
                    .collect();
            }
            _ => {
                // Only an average: spread it over the token count.
                let avg_ms = timings.get("predicted_per_token_ms").and_then(Value::as_f64);
                let count = timings.get("predicted_n").and_then(Value::as_u64);
                if let (Some(avg_ms), Some(count)) = (avg_ms, count) {
                    if avg_ms > 0.0 && count > 0 {
                        telemetry.decode_token_times =
                            vec![avg_ms / 1000.0; count as usize];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffer_detects_done_across_chunk_boundary() {
        let mut sniffer = SseSniffer::new();
        sniffer.observe(b"data: [DO");
        sniffer.observe(b"NE]\n\n");
        assert!(sniffer.saw_done);
    }

    #[test]
    fn test_sniffer_counts_token_frames() {
        let mut sniffer = SseSniffer::new();
        for text in ["Hello", " world", "!"] {
            let frame = format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n"
            );
            sniffer.observe(frame.as_bytes());
        }
        // Two intervals between three tokens.
        assert_eq!(sniffer.measured_decode_times.len(), 2);
    }

    #[test]
    fn test_usage_extraction() {
        let mut sniffer = SseSniffer::new();
        sniffer.observe(
            b"data: {\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":42}}\n\n",
        );
        let telemetry = sniffer.into_telemetry();
        assert_eq!(telemetry.input_tokens, 11);
        assert_eq!(telemetry.output_tokens, 42);
    }

    #[test]
    fn test_timings_average_is_distributed() {
        let mut sniffer = SseSniffer::new();
        sniffer.observe(
            b"data: {\"timings\":{\"prompt_n\":5,\"predicted_n\":4,\"prompt_ms\":200.0,\
              \"predicted_per_second\":40.0,\"predicted_per_token_ms\":25.0}}\n\n",
        );
        let telemetry = sniffer.into_telemetry();
        assert_eq!(telemetry.output_tokens, 4);
        assert!((telemetry.time_to_first_token_s - 0.2).abs() < 1e-9);
        assert_eq!(telemetry.decode_token_times, vec![0.025; 4]);
    }

    #[test]
    fn test_backend_reported_times_beat_measured() {
        let mut sniffer = SseSniffer::new();
        sniffer.observe(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n");
        sniffer.observe(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n");
        sniffer.observe(
            b"data: {\"timings\":{\"predicted_n\":2,\"predicted_ms\":[20.0,30.0]}}\n\n",
        );
        let telemetry = sniffer.into_telemetry();
        assert_eq!(telemetry.decode_token_times, vec![0.02, 0.03]);
    }

    #[test]
    fn test_measured_times_used_when_backend_is_silent() {
        let mut sniffer = SseSniffer::new();
        sniffer.observe(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n");
        sniffer.observe(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n");
        let telemetry = sniffer.into_telemetry();
        assert_eq!(telemetry.decode_token_times.len(), 1);
    }
}
