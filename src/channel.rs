//! Process-backed RPC channel to the pivot engine
//!
//! The channel owns the engine child process and its two pipe streams.
//! Commands are newline-delimited JSON text written to the engine's stdin;
//! responses are JSON object lines read from its stdout. Every public
//! operation holds one exclusive lock for its full duration, so channel
//! traffic is strictly serialized and line framing can never interleave.
//! Commands are infrequent and dominated by engine compute time, so the
//! lost throughput is irrelevant next to the framing guarantee.

use crate::error::{BridgeError, Result};
use serde_json::Value;
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Binary name searched for on PATH when no explicit path is given
pub const ENGINE_BINARY_NAME: &str = "pivot_engine";

/// Environment variable overriding engine binary discovery
pub const ENGINE_PATH_ENV: &str = "PIVOT_ENGINE_PATH";

/// Reserved line asking the engine to exit; not JSON by design so it can
/// never be confused with a command
const QUIT_SENTINEL: &str = "__quit__";

/// Poll interval while waiting out a shutdown grace window
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Channel configuration.
///
/// The defaults match the production engine contract; tests shorten the
/// grace windows and point discovery at throwaway names.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Binary name used for PATH discovery
    pub binary_name: String,
    /// Environment variable consulted before PATH discovery
    pub path_env: String,
    /// How long to wait after the quit sentinel before killing
    pub quit_grace: Duration,
    /// How long to wait after the first kill before killing again
    pub kill_grace: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            binary_name: ENGINE_BINARY_NAME.to_string(),
            path_env: ENGINE_PATH_ENV.to_string(),
            quit_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
        }
    }
}

/// Resolve the engine binary with the default configuration: the
/// `PIVOT_ENGINE_PATH` override first, then a PATH search for
/// `pivot_engine`. Exposed for host tooling that wants to report where
/// the engine would come from without starting it.
pub fn resolve_engine_binary() -> Option<PathBuf> {
    resolve_with(&ChannelConfig::default())
}

fn resolve_with(config: &ChannelConfig) -> Option<PathBuf> {
    if let Some(path) = env::var_os(&config.path_env) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let path_list = env::var_os("PATH")?;
    env::split_paths(&path_list)
        .map(|dir| dir.join(&config.binary_name))
        .find(|candidate| candidate.is_file())
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl Session {
    fn is_running(&mut self) -> bool {
        // Re-check with the OS; a child that exited on its own is
        // reported dead here, not just after the next failed write
        self.child.try_wait().ok().flatten().is_none()
    }

    fn write_line(&mut self, payload: &str) -> Result<()> {
        let mut line = payload.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(BridgeError::WriteFailed)
    }

    /// Read one line from the engine's stdout. `None` means the line was
    /// not valid UTF-8 and should be skipped like any other noise line.
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(BridgeError::ReadFailed)?;
        if n == 0 {
            return Err(BridgeError::ReadFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "engine closed its stdout",
            )));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8(buf).ok())
    }
}

/// Whether a line is a completed-response envelope: a JSON object with a
/// top-level `ok` field (any value).
fn is_complete_response(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.as_object().map(|obj| obj.contains_key("ok")))
        .unwrap_or(false)
}

/// Extract the top-level integer `id` of a response envelope, if any.
fn response_id(line: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.as_object()?.get("id")?.as_i64()
}

/// The RPC channel to the engine process.
///
/// One logical channel exists per host process: the embedding layer
/// constructs a single `EngineChannel` at startup and hands it to every
/// caller. Operations from multiple threads serialize on the internal
/// lock.
pub struct EngineChannel {
    config: ChannelConfig,
    session: Mutex<Option<Session>>,
}

impl Default for EngineChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineChannel {
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        // A caller panicking mid-operation must not wedge the channel
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch the engine process.
    ///
    /// Resolution order: explicit `path`, then the configured environment
    /// variable, then a PATH search for the configured binary name. A
    /// no-op returning success while already running. On failure the
    /// channel stays not-started with no leaked resources.
    pub fn start(&self, path: Option<&Path>) -> Result<()> {
        let mut guard = self.lock();

        if guard.as_mut().is_some_and(|s| s.is_running()) {
            return Ok(());
        }
        // A stale session means the child died on its own; reap it
        // before starting fresh
        if let Some(mut stale) = guard.take() {
            let _ = stale.child.wait();
        }

        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => resolve_with(&self.config).ok_or_else(|| {
                BridgeError::NotFound(format!(
                    "engine binary '{}' (set {} or put it on PATH)",
                    self.config.binary_name, self.config.path_env
                ))
            })?,
        };

        let mut child = Command::new(&resolved)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BridgeError::SpawnFailed {
                path: resolved.display().to_string(),
                source: e,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BridgeError::SpawnFailed {
                    path: resolved.display().to_string(),
                    source: io::Error::other("engine pipes were not created"),
                });
            }
        };

        if let Ok(Some(status)) = child.try_wait() {
            let _ = child.wait();
            return Err(BridgeError::SpawnFailed {
                path: resolved.display().to_string(),
                source: io::Error::other(format!("engine exited immediately: {status}")),
            });
        }

        tracing::info!(path = %resolved.display(), pid = child.id(), "engine process started");

        *guard = Some(Session {
            child,
            stdin,
            reader: BufReader::new(stdout),
        });
        Ok(())
    }

    /// Shut the engine down. No-op if not running; never fails.
    ///
    /// Escalation: quit sentinel, wait out the quit grace window, kill,
    /// wait out the kill grace window, kill once more without waiting.
    /// The process handle and both pipes are always released.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let Some(mut session) = guard.take() else {
            return;
        };

        if session.is_running() {
            tracing::info!("requesting graceful engine shutdown");
            let _ = session.write_line(QUIT_SENTINEL);

            if !wait_for_exit(&mut session.child, self.config.quit_grace) {
                tracing::warn!(
                    grace_ms = self.config.quit_grace.as_millis() as u64,
                    "engine ignored quit sentinel, killing"
                );
                let _ = session.child.kill();
                if !wait_for_exit(&mut session.child, self.config.kill_grace) {
                    let _ = session.child.kill();
                }
            }
        }

        // Reap if reapable; dropping the session closes both pipes
        let _ = session.child.try_wait();
        tracing::info!("engine channel stopped");
    }

    /// Current liveness, re-checked against the OS.
    pub fn is_running(&self) -> bool {
        self.lock().as_mut().is_some_and(|s| s.is_running())
    }

    /// Send one command line and block until the engine emits a
    /// completed-response envelope (a JSON object with a top-level `ok`
    /// field), returning that line verbatim. Lines that are not JSON
    /// objects, or objects without the marker, are skipped silently.
    pub fn send_command(&self, payload: &str) -> Result<String> {
        let mut guard = self.lock();
        let session = running_session(&mut guard)?;
        session.write_line(payload)?;

        loop {
            let Some(line) = session.next_line()? else {
                continue;
            };
            if line.is_empty() {
                continue;
            }
            if is_complete_response(&line) {
                return Ok(line);
            }
        }
    }

    /// Send one command line without waiting for any response. Callers
    /// pairing this with [`EngineChannel::wait_for_response`] embed their
    /// own correlation id in the payload.
    pub fn send_command_async(&self, payload: &str) -> Result<()> {
        let mut guard = self.lock();
        let session = running_session(&mut guard)?;
        session.write_line(payload)
    }

    /// Block until the engine emits an envelope whose top-level integer
    /// `id` equals `expected_id`, returning that line verbatim. A
    /// duplicated id matches on its first occurrence; envelopes with
    /// other ids (responses to other in-flight commands) are skipped.
    pub fn wait_for_response(&self, expected_id: i64) -> Result<String> {
        let mut guard = self.lock();
        let session = running_session(&mut guard)?;

        loop {
            let Some(line) = session.next_line()? else {
                continue;
            };
            if line.is_empty() {
                continue;
            }
            if response_id(&line) == Some(expected_id) {
                return Ok(line);
            }
        }
    }
}

impl Drop for EngineChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn running_session<'a>(
    guard: &'a mut std::sync::MutexGuard<'_, Option<Session>>,
) -> Result<&'a mut Session> {
    match guard.as_mut() {
        Some(session) => {
            if session.is_running() {
                Ok(session)
            } else {
                Err(BridgeError::NotRunning)
            }
        }
        None => Err(BridgeError::NotRunning),
    }
}

/// Poll the child until it exits or the window elapses.
fn wait_for_exit(child: &mut Child, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if child.try_wait().ok().flatten().is_some() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}
