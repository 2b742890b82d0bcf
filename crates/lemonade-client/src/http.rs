//! HTTP client with retryable, resumable downloads.
//!
//! Thin JSON GET/POST wrappers over reqwest plus the download machinery the
//! artifact fetcher depends on: exponential backoff between attempts,
//! byte-range resume of partial files, a low-speed abort, and the rule that
//! an exhausted download preserves its partial file so a re-run can resume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use lemonade_core::{Error, Result};

/// Suffix for in-progress downloads. Renamed away on success, so a file
/// carrying it is by definition incomplete.
pub const PARTIAL_SUFFIX: &str = ".partial";

const USER_AGENT: &str = "lemonade/0.8";

/// Response from a JSON GET/POST.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Tuning knobs for `download_file`.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub connect_timeout: Duration,
    /// Abort the attempt when the transfer rate stays below this many
    /// bytes/second…
    pub low_speed_limit: u64,
    /// …for this long.
    pub low_speed_time: Duration,
    pub resume_partial: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            connect_timeout: Duration::from_secs(30),
            low_speed_limit: 1024,
            low_speed_time: Duration::from_secs(60),
            resume_partial: true,
        }
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone, Default)]
pub struct DownloadSummary {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub http_code: u16,
}

enum AttemptError {
    /// Connection-class failure; the partial file can be resumed.
    Transient(String),
    /// HTTP or protocol failure; the partial file is useless.
    Fatal(String),
    /// The progress callback asked to stop.
    Cancelled,
}

/// Shared HTTP client. Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self { client }
    }

    /// GET returning the raw body. 300 s overall budget, suitable for hub
    /// metadata queries.
    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse> {
        let mut req = self.client.get(url).timeout(Duration::from_secs(300));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(|e| Error::network(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| Error::network(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }

    /// POST a JSON body. `timeout` of `None` means unbounded, for inference
    /// requests whose generation time is open-ended.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let mut req = self.client.post(url).json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(|e| Error::network(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| Error::network(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }

    /// Streaming POST. Each received chunk goes to `on_chunk`; returning
    /// `false` aborts the transfer (the usual cause is a disconnected
    /// client downstream of us). Returns the response status.
    pub async fn post_stream(
        &self,
        url: &str,
        body: String,
        mut on_chunk: impl FnMut(&[u8]) -> bool,
        timeout: Option<Duration>,
    ) -> Result<u16> {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await.map_err(|e| Error::network(e.to_string()))?;
        let status = resp.status().as_u16();

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if !on_chunk(&bytes) {
                        // Receiver hung up; dropping the stream aborts the
                        // upstream connection.
                        break;
                    }
                }
                // Backends close the connection after the final chunk, which
                // some stacks report as an error; treat EOF-ish failures as
                // end of stream.
                Err(e) if e.is_body() || e.is_decode() => {
                    tracing::debug!("stream ended: {}", e);
                    break;
                }
                Err(e) => return Err(Error::network(e.to_string())),
            }
        }
        Ok(status)
    }

    /// POST a multipart form (audio uploads and similar).
    pub async fn post_multipart(
        &self,
        url: &str,
        form: reqwest::multipart::Form,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let mut req = self.client.post(url).multipart(form);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await.map_err(|e| Error::network(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| Error::network(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }

    /// Streaming POST returning the live response, for consumers that drive
    /// the byte stream themselves (the streaming proxy).
    pub async fn post_stream_response(
        &self,
        url: &str,
        body: String,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        req.send().await.map_err(|e| Error::network(e.to_string()))
    }

    /// Probe a URL, true iff it answers 200 within `timeout`.
    pub async fn is_reachable(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(_) => false,
        }
    }

    /// Download `url` to `dest` with retries and resume.
    ///
    /// Data lands in `{dest}.partial` and is renamed into place on success.
    /// The progress callback receives `(bytes_downloaded, bytes_total)` and
    /// returns `false` to cancel. On exhausted retries the partial file is
    /// kept and the error tells the user a re-run will resume it.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        mut progress: Option<&mut (dyn FnMut(u64, u64) -> bool + Send)>,
        headers: &HashMap<String, String>,
        options: &DownloadOptions,
    ) -> Result<DownloadSummary> {
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut resume_offset = if options.resume_partial {
            partial_size(&partial).await
        } else {
            if partial_size(&partial).await > 0 {
                let _ = fs::remove_file(&partial).await;
            }
            0
        };
        if resume_offset > 0 {
            tracing::info!(
                "found partial file ({:.1} MB), resuming {}",
                resume_offset as f64 / (1024.0 * 1024.0),
                url
            );
        }

        let mut retry_delay_ms = options.initial_retry_delay_ms;
        let mut last_error = String::new();

        for attempt in 0..=options.max_retries {
            if attempt > 0 {
                tracing::info!(
                    "retry {}/{} after {:.1}s",
                    attempt,
                    options.max_retries,
                    retry_delay_ms as f64 / 1000.0
                );
                tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                retry_delay_ms = (retry_delay_ms * 2).min(options.max_retry_delay_ms);
                // The previous attempt may have grown the partial file.
                if options.resume_partial {
                    resume_offset = partial_size(&partial).await;
                }
            }

            let attempt_result = self
                .download_attempt(url, &partial, resume_offset, &mut progress, headers, options)
                .await;
            match attempt_result {
                Ok(summary) => {
                    fs::rename(&partial, dest).await?;
                    return Ok(summary);
                }
                Err(AttemptError::Cancelled) => return Err(Error::Cancelled),
                Err(AttemptError::Transient(msg)) => {
                    tracing::warn!("download interrupted (attempt {}): {}", attempt + 1, msg);
                    last_error = msg;
                }
                Err(AttemptError::Fatal(msg)) => {
                    tracing::warn!("download failed (attempt {}): {}", attempt + 1, msg);
                    last_error = msg;
                    // A fatal error invalidates whatever was written.
                    let _ = fs::remove_file(&partial).await;
                    resume_offset = 0;
                }
            }
        }

        let mut message = format!(
            "Download failed after {} attempts.\nLast error: {}",
            options.max_retries + 1,
            last_error
        );
        let remaining = partial_size(&partial).await;
        if remaining > 0 {
            message.push_str(&format!(
                "\nPartial file preserved: {} ({:.1} MB).\nRun the command again to resume from where it left off.",
                partial.display(),
                remaining as f64 / (1024.0 * 1024.0)
            ));
        }
        Err(Error::download(message))
    }

    async fn download_attempt(
        &self,
        url: &str,
        partial: &Path,
        resume_from: u64,
        progress: &mut Option<&mut (dyn FnMut(u64, u64) -> bool + Send)>,
        headers: &HashMap<String, String>,
        options: &DownloadOptions,
    ) -> std::result::Result<DownloadSummary, AttemptError> {
        let mut req = self
            .client
            .get(url)
            .connect_timeout(options.connect_timeout);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        if resume_from > 0 {
            req = req.header("Range", format!("bytes={resume_from}-"));
        }

        let resp = match req.send().await {
            Ok(r) => r,
            // A transient failure is only worth resuming when bytes already
            // landed; otherwise restart clean.
            Err(e) if is_transient(&e) && resume_from > 0 => {
                return Err(AttemptError::Transient(e.to_string()));
            }
            Err(e) => return Err(AttemptError::Fatal(e.to_string())),
        };

        let http_code = resp.status().as_u16();

        // 416 while resuming means the file was already fully transferred.
        if http_code == 416 && resume_from > 0 {
            tracing::info!("file already complete: {}", partial.display());
            return Ok(DownloadSummary {
                bytes_downloaded: 0,
                total_bytes: resume_from,
                http_code,
            });
        }
        if http_code >= 400 {
            return Err(AttemptError::Fatal(format!(
                "HTTP error {http_code} for URL: {url}"
            )));
        }

        let content_length = resp.content_length().unwrap_or(0);
        let total_bytes = resume_from + content_length;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(resume_from > 0)
            .write(true)
            .truncate(resume_from == 0)
            .open(partial)
            .await
            .map_err(|e| AttemptError::Fatal(format!("cannot open {}: {e}", partial.display())))?;

        let mut written = resume_from;
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    // Mid-body failures leave a usable partial file.
                    return Err(AttemptError::Transient(e.to_string()));
                }
            };
            file.write_all(&bytes)
                .await
                .map_err(|e| AttemptError::Fatal(format!("write failed: {e}")))?;
            written += bytes.len() as u64;
            window_bytes += bytes.len() as u64;

            if let Some(cb) = progress.as_deref_mut() {
                if !cb(written, total_bytes) {
                    let _ = file.flush().await;
                    return Err(AttemptError::Cancelled);
                }
            }

            let elapsed = window_start.elapsed();
            if elapsed >= options.low_speed_time {
                let rate = window_bytes as f64 / elapsed.as_secs_f64();
                if (rate as u64) < options.low_speed_limit {
                    return Err(AttemptError::Transient(format!(
                        "transfer rate {:.0} B/s below limit {} B/s for {:?}",
                        rate, options.low_speed_limit, options.low_speed_time
                    )));
                }
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::Fatal(format!("flush failed: {e}")))?;

        Ok(DownloadSummary {
            bytes_downloaded: written - resume_from,
            total_bytes: if total_bytes > 0 { total_bytes } else { written },
            http_code,
        })
    }
}

/// `{dest}.partial` alongside the destination.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

async fn partial_size(partial: &Path) -> u64 {
    fs::metadata(partial).await.map(|m| m.len()).unwrap_or(0)
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_body() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path() {
        let p = partial_path(Path::new("/tmp/model.gguf"));
        assert_eq!(p, PathBuf::from("/tmp/model.gguf.partial"));
    }

    #[test]
    fn test_backoff_progression_is_capped() {
        let options = DownloadOptions {
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 4_000,
            ..Default::default()
        };
        let mut delay = options.initial_retry_delay_ms;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(delay);
            delay = (delay * 2).min(options.max_retry_delay_ms);
        }
        assert_eq!(seen, vec![1_000, 2_000, 4_000, 4_000]);
    }

    #[tokio::test]
    async fn test_partial_size_of_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(partial_size(&dir.path().join("nothing.partial")).await, 0);
    }
}
