//! Child-process management for backend servers.
//!
//! Each backend instance owns exactly one child process. The manager drains
//! the child's stdout on a background task so telemetry-bearing lines can be
//! observed and self-poll chatter can be filtered out, and it offers the
//! free-port probe used when assigning a backend its TCP port.

use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use lemonade_core::{Error, Result};

/// Drop a stdout line when this returns true.
pub type LineFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Observe every (unfiltered) stdout line, e.g. for telemetry capture.
pub type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for spawning a managed child process.
#[derive(Default, Clone)]
pub struct SpawnOptions {
    pub working_dir: Option<std::path::PathBuf>,
    /// Mirror child output into our log. Off for chatty backends.
    pub inherit_output: bool,
    pub stdout_filter: Option<LineFilter>,
    pub stdout_observer: Option<LineObserver>,
}

/// A spawned child process plus its drain task.
pub struct ManagedProcess {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl ManagedProcess {
    /// Spawn `executable args…` with piped output and start the drain task.
    pub fn spawn(
        executable: impl AsRef<Path>,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Self> {
        let executable = executable.as_ref();
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());

        tracing::info!("starting process: {} {}", executable.display(), args.join(" "));

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::process(format!("failed to start {name}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::process(format!("{name} exited before it could be tracked")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let managed = Self {
            name: name.clone(),
            pid,
            child: Arc::new(Mutex::new(child)),
            exit_code: Arc::new(Mutex::new(None)),
        };

        if let Some(stdout) = stdout {
            spawn_drain(name.clone(), "stdout", stdout, options.clone());
        }
        if let Some(stderr) = stderr {
            // stderr is never filtered; backends log startup errors there.
            let opts = SpawnOptions {
                stdout_filter: None,
                ..options
            };
            spawn_drain(name, "stderr", stderr, opts);
        }

        Ok(managed)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while the child has not exited.
    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                *self.exit_code.lock().await = status.code();
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Exit code once the child has exited, if the OS reported one.
    pub async fn exit_code(&self) -> Option<i32> {
        if self.is_running().await {
            return None;
        }
        *self.exit_code.lock().await
    }

    /// Kill the process (process group on unix) and wait for it to go away.
    pub async fn stop(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }
        tracing::info!("stopping process {} (pid {})", self.name, self.pid);

        #[cfg(unix)]
        {
            // Negative pid targets the whole process group, catching any
            // workers the backend forked.
            unsafe {
                libc::kill(-(self.pid as i32), libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_ok()
            {
                return Ok(());
            }
        }

        child
            .kill()
            .await
            .map_err(|e| Error::process(format!("failed to kill {}: {e}", self.name)))?;
        Ok(())
    }

    /// Wait up to `timeout` for the child to exit on its own.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Result<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut child = self.child.lock().await;
                if let Ok(Some(status)) = child.try_wait() {
                    let code = status.code().unwrap_or(-1);
                    *self.exit_code.lock().await = status.code();
                    return Ok(code);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "{} did not exit within {:?}",
                    self.name, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn spawn_drain<R>(name: String, channel: &'static str, reader: R, options: SpawnOptions)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(filter) = &options.stdout_filter {
                if filter(&line) {
                    continue;
                }
            }
            if let Some(observer) = &options.stdout_observer {
                observer(&line);
            }
            if options.inherit_output {
                tracing::info!(target: "backend", "[{name}:{channel}] {line}");
            } else {
                tracing::debug!(target: "backend", "[{name}:{channel}] {line}");
            }
        }
    });
}

/// Find an unused TCP port, preferring `hint` and scanning upward from it.
pub fn find_free_port(hint: u16) -> Result<u16> {
    for port in hint..hint.saturating_add(100) {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    // Scan window exhausted; let the OS pick.
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Error::process(format!("no free port available: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::process(e.to_string()))?
        .port();
    Ok(port)
}

/// Run a command to completion, feeding each output line to `on_line`.
///
/// Used for CLI-managed pulls where progress is parsed from stdout. The
/// callback returning `false` kills the child and yields `Error::Cancelled`.
pub async fn run_with_output(
    executable: impl AsRef<Path>,
    args: &[String],
    mut on_line: impl FnMut(&str) -> bool,
) -> Result<i32> {
    let executable = executable.as_ref();
    tracing::info!(
        "running: {} {}",
        executable.display(),
        args.join(" ")
    );

    let mut child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::process(format!("failed to run {}: {e}", executable.display())))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    // Drain stderr on the side so a chatty child cannot block on a full pipe.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "backend", "{line}");
            }
        });
    }
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if !on_line(&line) {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::process(e.to_string()))?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port_returns_bindable_port() {
        let port = find_free_port(18231).unwrap();
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_output_collects_lines() {
        let mut seen = Vec::new();
        let code = run_with_output(
            "/bin/sh",
            &["-c".to_string(), "echo one; echo two".to_string()],
            |line| {
                seen.push(line.to_string());
                true
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_output_cancel_kills_child() {
        let err = run_with_output(
            "/bin/sh",
            &["-c".to_string(), "echo first; sleep 30; echo never".to_string()],
            |_| false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_stop() {
        let proc = ManagedProcess::spawn(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            SpawnOptions::default(),
        )
        .unwrap();
        assert!(proc.is_running().await);
        proc.stop().await.unwrap();
        assert!(!proc.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_of_finished_process() {
        let proc = ManagedProcess::spawn(
            "/bin/sh",
            &["-c".to_string(), "exit 3".to_string()],
            SpawnOptions::default(),
        )
        .unwrap();
        let code = proc.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(proc.exit_code().await, Some(3));
    }
}
