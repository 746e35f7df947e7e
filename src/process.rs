//! Bounded subprocess execution for agent and quality-check commands.
//!
//! Both consumers want the same thing: run a command under a deadline and
//! keep a single transcript of everything it printed, capped so a chatty
//! child cannot exhaust memory. Stdout and stderr drain concurrently into
//! one shared tail buffer; bytes past the cap are counted and discarded
//! while the pipes keep flowing.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Outcome of a captured subprocess run.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    /// Merged stdout/stderr as lossy UTF-8, ending with drop and timeout
    /// notices when either applies.
    pub transcript: String,
    pub timed_out: bool,
    pub dropped_bytes: usize,
}

impl Captured {
    /// True when the child finished on its own with exit code 0.
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Tail buffer shared by both stream readers.
struct Tail {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl Tail {
    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }
}

/// Run `cmd`, feeding `stdin` to the child and waiting at most `timeout`.
///
/// The readers start before stdin is written so a child that talks before
/// it listens cannot deadlock the runner. On timeout the child is killed
/// and the partial transcript is returned with a notice; `label` names
/// the command in those notices.
pub fn run_captured(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    capture_limit: usize,
    label: &str,
) -> Result<Captured> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tail = Arc::new(Mutex::new(Tail {
        buf: Vec::new(),
        limit: capture_limit,
        dropped: 0,
    }));
    let stdout_drain = spawn_drain(stdout, tail.clone());
    let stderr_drain = spawn_drain(stderr, tail.clone());

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    for drain in [stdout_drain, stderr_drain] {
        drain
            .join()
            .map_err(|_| anyhow!("drain thread panicked"))?
            .context("drain output")?;
    }

    let tail = Arc::try_unwrap(tail)
        .map_err(|_| anyhow!("tail buffer still shared after join"))?
        .into_inner()
        .map_err(|_| anyhow!("tail mutex poisoned"))?;

    let mut transcript = String::from_utf8_lossy(&tail.buf).into_owned();
    if tail.dropped > 0 {
        transcript.push_str(&format!("\n[{label}: {} bytes dropped]\n", tail.dropped));
    }
    if timed_out {
        transcript.push_str(&format!(
            "\n[{label} timed out after {}s]\n",
            timeout.as_secs()
        ));
    }

    Ok(Captured {
        status,
        transcript,
        timed_out,
        dropped_bytes: tail.dropped,
    })
}

fn spawn_drain<R: Read + Send + 'static>(
    mut reader: R,
    tail: Arc<Mutex<Tail>>,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            let n = reader.read(&mut chunk).context("read output")?;
            if n == 0 {
                return Ok(());
            }
            let mut tail = tail.lock().map_err(|_| anyhow!("tail mutex poisoned"))?;
            tail.push(&chunk[..n]);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_merges_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let captured =
            run_captured(cmd, None, Duration::from_secs(5), 1000, "test").expect("run");
        assert!(captured.success());
        assert!(captured.transcript.contains("out"));
        assert!(captured.transcript.contains("err"));
        assert_eq!(captured.dropped_bytes, 0);
    }

    #[test]
    fn cap_drops_excess_bytes_with_a_notice() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);
        let captured = run_captured(cmd, None, Duration::from_secs(5), 4, "noisy").expect("run");
        assert_eq!(captured.dropped_bytes, 6);
        assert!(captured.transcript.starts_with("abcd"));
        assert!(captured.transcript.contains("[noisy: 6 bytes dropped]"));
    }

    #[test]
    fn timeout_kills_the_child_and_marks_the_transcript() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo partial; sleep 5"]);
        let captured =
            run_captured(cmd, None, Duration::from_millis(200), 1000, "slow").expect("run");
        assert!(captured.timed_out);
        assert!(!captured.success());
        assert!(captured.transcript.contains("partial"));
        assert!(captured.transcript.contains("[slow timed out after 0s]"));
    }

    #[test]
    fn stdin_is_fed_and_closed() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let captured =
            run_captured(cmd, Some(b"ping"), Duration::from_secs(5), 1000, "cat").expect("run");
        assert!(captured.success());
        assert_eq!(captured.transcript, "ping");
    }

    #[test]
    fn failing_exit_code_is_not_success() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let captured =
            run_captured(cmd, None, Duration::from_secs(5), 1000, "test").expect("run");
        assert!(!captured.success());
        assert!(!captured.timed_out);
        assert_eq!(captured.status.code(), Some(3));
    }
}
