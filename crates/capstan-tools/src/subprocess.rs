// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subprocess tool runtime: foreground and background shells.
//!
//! One [`SubprocessRuntime`] instance owns the background-shell table.  It is
//! constructed once and passed to tools through [`crate::ToolCtx`], so
//! multiple call sites reach the same table without hidden globals.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured output above this many bytes is truncated with a trailing marker.
pub const OUTPUT_LIMIT_BYTES: usize = 30_000;

/// How long to let the pipe readers drain after the child was killed.
/// Grandchildren that inherited the pipes can hold them open forever.
const KILLED_READER_GRACE: Duration = Duration::from_millis(200);

/// Reader grace after a normal exit; generous, but bounded so a daemonized
/// grandchild holding the pipe cannot hang the tool call.
const EXIT_READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStatus {
    Running,
    Exited(Option<i32>),
    Killed,
}

impl ShellStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ShellStatus::Running)
    }
}

/// Result of a foreground shell run.
#[derive(Debug, Clone)]
pub struct ShellOutcome {
    /// stdout, then stderr, separated by a newline; truncated at the cap.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Snapshot of a background shell, taken by [`SubprocessRuntime::output`].
#[derive(Debug, Clone)]
pub struct BackgroundSnapshot {
    pub command: String,
    pub output: String,
    pub status: ShellStatus,
}

struct BackgroundShell {
    command: String,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    status: Arc<Mutex<ShellStatus>>,
    kill_tx: mpsc::Sender<()>,
}

/// Process-wide table of background shells plus the foreground spawn path.
#[derive(Default)]
pub struct SubprocessRuntime {
    shells: Mutex<HashMap<String, BackgroundShell>>,
    next_id: AtomicU64,
}

impl SubprocessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a command in the foreground, capturing stdout and stderr until it
    /// exits, times out, or the caller cancels.  On timeout the child is
    /// killed and whatever output was captured so far is returned with
    /// `timed_out` set.
    pub async fn run_foreground(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ShellOutcome> {
        let mut child = shell_command(command, working_dir, env)?;
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut out_task = read_into(child.stdout.take(), Arc::clone(&stdout));
        let mut err_task = read_into(child.stderr.take(), Arc::clone(&stderr));

        let (exit_code, timed_out, grace) = tokio::select! {
            status = child.wait() => (status?.code(), false, EXIT_READER_GRACE),
            _ = tokio::time::sleep(timeout) => {
                debug!(command, ?timeout, "foreground shell timed out; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, true, KILLED_READER_GRACE)
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, false, KILLED_READER_GRACE)
            }
        };

        settle_readers(&mut out_task, &mut err_task, grace).await;

        let output = combine_streams(
            &String::from_utf8_lossy(&stdout.lock().expect("stdout buffer poisoned")),
            &String::from_utf8_lossy(&stderr.lock().expect("stderr buffer poisoned")),
        );
        Ok(ShellOutcome {
            output: truncate_output(&output),
            exit_code,
            timed_out,
        })
    }

    /// Spawn a command in the background and return its `bg_N` id.  The
    /// process and its growing buffers live in the runtime table until
    /// killed or retrieved after completion.
    pub fn spawn_background(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let mut child = shell_command(command, working_dir, env)?;
        let id = format!("bg_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(Mutex::new(ShellStatus::Running));
        let mut out_task = read_into(child.stdout.take(), Arc::clone(&stdout));
        let mut err_task = read_into(child.stderr.take(), Arc::clone(&stderr));
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        let entry = BackgroundShell {
            command: command.to_string(),
            stdout,
            stderr,
            status: Arc::clone(&status),
            kill_tx,
        };

        let monitor_cancel = cancel.clone();
        let monitor_id = id.clone();
        tokio::spawn(async move {
            let (final_status, grace) = tokio::select! {
                result = child.wait() => {
                    let code = result.ok().and_then(|s| s.code());
                    (ShellStatus::Exited(code), EXIT_READER_GRACE)
                }
                _ = kill_rx.recv() => {
                    let _ = child.kill().await;
                    (ShellStatus::Killed, KILLED_READER_GRACE)
                }
                _ = monitor_cancel.cancelled() => {
                    let _ = child.kill().await;
                    (ShellStatus::Killed, KILLED_READER_GRACE)
                }
            };
            settle_readers(&mut out_task, &mut err_task, grace).await;
            *status.lock().expect("status lock poisoned") = final_status;
            debug!(id = %monitor_id, ?final_status, "background shell finished");
        });

        self.shells
            .lock()
            .expect("shell table poisoned")
            .insert(id.clone(), entry);
        Ok(id)
    }

    /// Current output of a background shell.  A finished entry is removed on
    /// first retrieval; a running one stays in the table.
    pub fn output(&self, id: &str) -> Option<BackgroundSnapshot> {
        let mut table = self.shells.lock().expect("shell table poisoned");
        let entry = table.get(id)?;
        let status = *entry.status.lock().expect("status lock poisoned");
        let combined = combine_streams(
            &String::from_utf8_lossy(&entry.stdout.lock().expect("stdout buffer poisoned")),
            &String::from_utf8_lossy(&entry.stderr.lock().expect("stderr buffer poisoned")),
        );
        let snapshot = BackgroundSnapshot {
            command: entry.command.clone(),
            output: truncate_output(&combined),
            status,
        };
        if status.is_finished() {
            table.remove(id);
        }
        Some(snapshot)
    }

    /// Request termination of a background shell.  Returns `false` when the
    /// id is unknown or the shell already finished.
    pub fn kill(&self, id: &str) -> bool {
        let table = self.shells.lock().expect("shell table poisoned");
        match table.get(id) {
            Some(entry) => entry.kill_tx.try_send(()).is_ok(),
            None => false,
        }
    }

    /// Ids currently present in the table (running or awaiting retrieval).
    pub fn background_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shells
            .lock()
            .expect("shell table poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

fn shell_command(
    command: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> anyhow::Result<tokio::process::Child> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Detach from the controlling terminal so the child cannot reach the
    // caller's tty even via /dev/tty.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    Ok(cmd.spawn()?)
}

fn read_into(
    src: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    buf: Arc<Mutex<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut src) = src else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match src.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf
                    .lock()
                    .expect("capture buffer poisoned")
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Wait for the pipe readers to drain, bounded by `grace`, then abort them.
async fn settle_readers(out: &mut JoinHandle<()>, err: &mut JoinHandle<()>, grace: Duration) {
    let join = async {
        let _ = (&mut *out).await;
        let _ = (&mut *err).await;
    };
    if tokio::time::timeout(grace, join).await.is_err() {
        out.abort();
        err.abort();
    }
}

/// stdout first, stderr after, separated by a newline.
fn combine_streams(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    }
}

/// Cap output at [`OUTPUT_LIMIT_BYTES`], appending the elision marker.
pub fn truncate_output(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let mut cut = OUTPUT_LIMIT_BYTES;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let elided = s[cut..].chars().count();
    format!(
        "{}[Output truncated - {} more characters not shown]",
        &s[..cut],
        elided
    )
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
