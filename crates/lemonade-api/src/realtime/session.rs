//! Realtime transcription sessions.
//!
//! One session per WebSocket connection: a PCM accumulator, a
//! voice-activity detector, and the configured transcription model.
//! Incoming `audio_chunk` messages run VAD over the most recent 100 ms;
//! detected speech boundaries emit `input_audio_buffer.*` events and a
//! speech end (or an explicit `commit`) triggers transcription through the
//! router's whisper backend.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Value};

use lemonade_core::{Error, Result};
use lemonade_router::Router;

use super::buffer::{StreamingAudioBuffer, SAMPLE_RATE};
use super::vad::{SimpleVad, VadConfig, VadEvent};

/// Pad clips up to 1.25 s; whisper hallucinates on shorter audio.
const MIN_CLIP_MS: u64 = 1_250;

/// VAD runs over the trailing 100 ms on each appended chunk.
const VAD_WINDOW_MS: u64 = 100;

/// Tracks the set of live sessions (diagnostics) and hands out ids.
#[derive(Default)]
pub struct RealtimeSessionManager {
    sessions: parking_lot::Mutex<HashSet<String>>,
}

impl RealtimeSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> String {
        let id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        self.sessions.lock().insert(id.clone());
        id
    }

    pub fn close(&self, id: &str) {
        self.sessions.lock().remove(id);
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Per-connection state machine.
pub struct RealtimeSession {
    pub id: String,
    router: Arc<Router>,
    model: String,
    buffer: StreamingAudioBuffer,
    vad: SimpleVad,
    started: bool,
}

impl RealtimeSession {
    pub fn new(id: String, router: Arc<Router>) -> Self {
        Self {
            id,
            router,
            model: String::new(),
            buffer: StreamingAudioBuffer::new(),
            vad: SimpleVad::new(VadConfig::default()),
            started: false,
        }
    }

    /// Handle one client message, returning the events to send back.
    pub async fn handle_message(&mut self, message: &Value) -> Vec<Value> {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "start" => self.handle_start(message),
            "update" => self.handle_update(message),
            "audio_chunk" => self.handle_audio_chunk(message).await,
            "commit" => self.handle_commit().await,
            "clear" => self.handle_clear(),
            other => vec![error_event(&Error::validation(format!(
                "unknown message type '{other}'"
            )))],
        }
    }

    fn handle_start(&mut self, message: &Value) -> Vec<Value> {
        self.apply_config(message);
        self.started = true;
        vec![json!({
            "type": "ready",
            "session": { "id": self.id, "model": self.model },
        })]
    }

    /// Reconfigure a live session (model, VAD parameters) without dropping
    /// buffered audio.
    fn handle_update(&mut self, message: &Value) -> Vec<Value> {
        if !self.started {
            return vec![error_event(&Error::validation(
                "send a 'start' message before updating the session",
            ))];
        }
        self.apply_config(message);
        vec![json!({
            "type": "transcription_session.updated",
            "session": { "id": self.id, "model": self.model },
        })]
    }

    fn apply_config(&mut self, message: &Value) {
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
        if let Some(td) = message.get("turn_detection") {
            self.vad.set_config(vad_config_from(td));
        }
    }

    async fn handle_audio_chunk(&mut self, message: &Value) -> Vec<Value> {
        if !self.started {
            return vec![error_event(&Error::validation(
                "send a 'start' message before audio",
            ))];
        }
        let Some(audio) = message.get("audio").and_then(Value::as_str) else {
            return vec![error_event(&Error::validation(
                "audio_chunk is missing the 'audio' field",
            ))];
        };
        if let Err(e) = self.buffer.append_base64(audio) {
            return vec![error_event(&e)];
        }

        let mut events = Vec::new();
        let recent = self.buffer.recent_samples(VAD_WINDOW_MS);
        match self.vad.process(&recent, SAMPLE_RATE) {
            VadEvent::SpeechStart => {
                events.push(json!({
                    "type": "input_audio_buffer.speech_started",
                    "audio_start_ms": self.vad.speech_start_ms(),
                }));
            }
            VadEvent::SpeechEnd => {
                events.push(json!({
                    "type": "input_audio_buffer.speech_stopped",
                    "audio_end_ms": self.vad.speech_end_ms(),
                }));
                events.extend(self.transcribe().await);
            }
            VadEvent::None => {}
        }
        events
    }

    async fn handle_commit(&mut self) -> Vec<Value> {
        if self.buffer.is_empty() {
            return vec![error_event(&Error::validation("audio buffer is empty"))];
        }
        let mut events = vec![json!({ "type": "input_audio_buffer.committed" })];
        events.extend(self.transcribe().await);
        events
    }

    fn handle_clear(&mut self) -> Vec<Value> {
        self.buffer.clear();
        self.vad.reset();
        vec![json!({ "type": "input_audio_buffer.cleared" })]
    }

    /// Frame the buffer as WAV and run it through the transcription
    /// backend. The buffer is cleared only after a successful transcript.
    async fn transcribe(&mut self) -> Vec<Value> {
        match self.transcribe_inner().await {
            Ok(transcript) => {
                self.buffer.clear();
                self.vad.reset();
                vec![json!({
                    "type": "conversation.item.input_audio_transcription.completed",
                    "transcript": transcript,
                })]
            }
            Err(e) => {
                tracing::warn!("realtime transcription failed: {e}");
                vec![error_event(&e)]
            }
        }
    }

    async fn transcribe_inner(&self) -> Result<String> {
        if self.model.is_empty() {
            return Err(Error::validation(
                "no transcription model configured; include 'model' in the start message",
            ));
        }
        let wav = self.buffer.to_wav_padded(MIN_CLIP_MS)?;
        tracing::debug!(
            "transcribing {} bytes of audio ({} ms buffered)",
            wav.len(),
            self.buffer.duration_ms()
        );

        let request = json!({
            "model": self.model,
            "file_data": base64::engine::general_purpose::STANDARD.encode(&wav),
            "filename": "realtime_audio.wav",
        });
        let response = self.router.audio_transcriptions(&request).await?;
        Ok(response
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }
}

fn vad_config_from(turn_detection: &Value) -> VadConfig {
    let mut config = VadConfig::default();
    if let Some(threshold) = turn_detection.get("threshold").and_then(Value::as_f64) {
        config.energy_threshold = threshold as f32;
    }
    if let Some(silence) = turn_detection
        .get("silence_duration_ms")
        .and_then(Value::as_u64)
    {
        config.min_silence_ms = silence;
    }
    if let Some(prefix) = turn_detection
        .get("prefix_padding_ms")
        .and_then(Value::as_u64)
    {
        config.min_speech_ms = prefix;
    }
    config
}

fn error_event(error: &Error) -> Value {
    json!({
        "type": "error",
        "error": error.to_error_json()["error"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemonade_catalog::ModelCatalog;
    use lemonade_router::{Router, RouterConfig};

    fn session() -> RealtimeSession {
        let catalog = Arc::new(ModelCatalog::from_values(json!({}), json!({})));
        let router = Arc::new(Router::new(catalog, RouterConfig::default()));
        RealtimeSession::new("sess_test".into(), router)
    }

    fn pcm_chunk(amplitude: i16, ms: u64) -> String {
        let count = (SAMPLE_RATE as u64 * ms / 1000) as usize;
        let mut bytes = Vec::with_capacity(count * 2);
        for _ in 0..count {
            bytes.extend_from_slice(&amplitude.to_le_bytes());
        }
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[tokio::test]
    async fn test_start_responds_ready() {
        let mut session = session();
        let events = session
            .handle_message(&json!({ "type": "start", "model": "Whisper-Base" }))
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "ready");
        assert_eq!(events[0]["session"]["model"], "Whisper-Base");
    }

    #[tokio::test]
    async fn test_update_reconfigures_live_session() {
        let mut session = session();
        session
            .handle_message(&json!({ "type": "start", "model": "Whisper-Base" }))
            .await;

        let events = session
            .handle_message(&json!({
                "type": "update",
                "model": "Whisper-Small",
                "turn_detection": { "silence_duration_ms": 250 },
            }))
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "transcription_session.updated");
        assert_eq!(events[0]["session"]["model"], "Whisper-Small");
        assert_eq!(session.model, "Whisper-Small");
    }

    #[tokio::test]
    async fn test_update_before_start_is_rejected() {
        let mut session = session();
        let events = session
            .handle_message(&json!({ "type": "update", "model": "Whisper-Small" }))
            .await;
        assert_eq!(events[0]["type"], "error");
    }

    #[tokio::test]
    async fn test_audio_before_start_is_rejected() {
        let mut session = session();
        let events = session
            .handle_message(&json!({ "type": "audio_chunk", "audio": pcm_chunk(0, 100) }))
            .await;
        assert_eq!(events[0]["type"], "error");
    }

    #[tokio::test]
    async fn test_speech_started_event_on_loud_audio() {
        let mut session = session();
        session
            .handle_message(&json!({ "type": "start", "model": "Whisper-Base" }))
            .await;

        let mut saw_start = false;
        for _ in 0..5 {
            let events = session
                .handle_message(&json!({ "type": "audio_chunk", "audio": pcm_chunk(20_000, 100) }))
                .await;
            if events
                .iter()
                .any(|e| e["type"] == "input_audio_buffer.speech_started")
            {
                saw_start = true;
                break;
            }
        }
        assert!(saw_start);
    }

    #[tokio::test]
    async fn test_clear_resets_buffer() {
        let mut session = session();
        session
            .handle_message(&json!({ "type": "start", "model": "Whisper-Base" }))
            .await;
        session
            .handle_message(&json!({ "type": "audio_chunk", "audio": pcm_chunk(100, 100) }))
            .await;
        assert!(!session.buffer.is_empty());

        let events = session.handle_message(&json!({ "type": "clear" })).await;
        assert_eq!(events[0]["type"], "input_audio_buffer.cleared");
        assert!(session.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_commit_on_empty_buffer_errors() {
        let mut session = session();
        session
            .handle_message(&json!({ "type": "start", "model": "Whisper-Base" }))
            .await;
        let events = session.handle_message(&json!({ "type": "commit" })).await;
        assert_eq!(events[0]["type"], "error");
    }

    #[test]
    fn test_manager_tracks_sessions() {
        let manager = RealtimeSessionManager::new();
        let id = manager.open();
        assert!(id.starts_with("sess_"));
        assert_eq!(manager.active_count(), 1);
        manager.close(&id);
        assert_eq!(manager.active_count(), 0);
    }
}
