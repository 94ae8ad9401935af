//! Child process supervision with timeouts, bounded output, and heartbeats.
//!
//! The agent subprocess is the only long-running operation in the engine.
//! It is supervised as an explicit state machine: a timeout deadline, a
//! forceful kill on expiry, bounded output capture, and a heartbeat ticker
//! that emits periodic liveness log events during silent periods.
//! Heartbeats are liveness only; they never represent progress and never
//! extend the timeout.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Combined lossy stdout+stderr text, with truncation notices.
    pub fn combined_text(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        if self.timed_out {
            buf.push_str("\n[timed out]\n");
        }
        buf
    }
}

/// Run a command with a timeout, capturing output and streaming stdout lines
/// to a file for real-time observability.
///
/// Output is read concurrently while the child runs; `output_limit_bytes`
/// bounds the bytes kept in memory while the pipes are still drained. When
/// `heartbeat` is `Some`, a liveness event is logged at that interval until
/// the child exits.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_supervised(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&std::path::Path>,
    heartbeat: Option<Duration>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    // Feed stdin from a thread so a child that writes before reading
    // cannot deadlock against a full pipe.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stream_file = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(std::sync::Mutex::new(std::io::BufWriter::new(file)))
        }
        None => None,
    };
    let stream_file = Arc::new(stream_file);
    let stream_file_clone = stream_file.clone();

    let stdout_handle =
        thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, stream_file_clone));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stop = Arc::new(AtomicBool::new(false));
    let heartbeat_handle = heartbeat.map(|interval| {
        let stop = stop.clone();
        thread::spawn(move || heartbeat_loop(interval, &stop))
    });

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = heartbeat_handle {
        let _ = handle.join();
    }

    if let Some(handle) = stdin_handle {
        // A closed-pipe write error just means the child exited early.
        let _ = handle.join();
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn heartbeat_loop(interval: Duration, stop: &AtomicBool) {
    let started = Instant::now();
    let mut next = interval;
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200).min(interval));
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if started.elapsed() >= next {
            info!(elapsed_secs = started.elapsed().as_secs(), "agent heartbeat");
            next += interval;
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line-wise with a size limit, tee-ing lines to a file.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream_file: Arc<Option<std::sync::Mutex<std::io::BufWriter<std::fs::File>>>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line for real-time visibility.
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
