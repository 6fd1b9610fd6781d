//! The task that owns one pty master and its child process.
//!
//! All pty I/O goes through [`PtyRequest`]s so the blocking handles never leave
//! this task. Output is read on a dedicated OS thread and fanned out over a
//! broadcast channel.

use anyhow::{Context, Result, anyhow};
use portable_pty::{Child, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pty_session::{OutputEvent, PtyState};

/// How long a child gets to exit after SIGHUP before it is killed outright.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 4096;
const INITIAL_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

/// Forwarded environment, on top of the terminal type.
const INHERITED_ENV: [&str; 5] = ["PATH", "HOME", "USER", "LANG", "SHELL"];

pub enum PtyRequest {
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Resize {
        size: PtySize,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<PtyState>,
    },
    /// Hang up the child, escalate to SIGKILL, reap it and stop the actor.
    Close { reply: oneshot::Sender<()> },
}

pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    input: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    requests: mpsc::Receiver<PtyRequest>,
    exited: CancellationToken,
}

fn open_pty() -> Result<PtyPair> {
    native_pty_system()
        .openpty(INITIAL_SIZE)
        .context("Failed to open PTY")
}

fn build_command(program: &str, args: &[String], working_dir: Option<&str>) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.cwd(dir);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for key in INHERITED_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd
}

/// Bytes at the end of `bytes` that start a UTF-8 sequence the buffer does not
/// finish yet.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let len = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if len > back { back } else { 0 };
    }
    0
}

/// Decode what is complete in `pending`, leaving a split character behind for
/// the next read.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let keep = incomplete_utf8_tail(pending);
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

fn send_output(output: &broadcast::Sender<OutputEvent>, data: String) {
    if data.is_empty() {
        return;
    }
    let _ = output.send(OutputEvent {
        data,
        timestamp: chrono::Utc::now().timestamp_millis(),
    });
}

/// Blocking read loop; cancels `exited` on EOF or read error (EIO is how
/// Linux reports a hung-up pty).
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    output: broadcast::Sender<OutputEvent>,
    exited: CancellationToken,
) {
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::with_capacity(READ_CHUNK + 4);
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("PTY read ended: {}", e);
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        send_output(&output, drain_utf8(&mut pending));
    }
    send_output(&output, String::from_utf8_lossy(&pending).into_owned());
    exited.cancel();
}

impl PtyActor {
    /// Start `program` on a fresh pty and run the actor on its own task.
    ///
    /// `exited` is cancelled once the child stops producing output, which is
    /// how natural exits are observed. The returned receiver is created before
    /// the reader starts, so it sees every byte.
    pub fn spawn(
        program: &str,
        args: &[String],
        working_dir: Option<&str>,
        exited: CancellationToken,
    ) -> Result<(mpsc::Sender<PtyRequest>, broadcast::Receiver<OutputEvent>)> {
        let pair = open_pty()?;
        let child = pair
            .slave
            .spawn_command(build_command(program, args, working_dir))
            .with_context(|| format!("Failed to spawn '{}'", program))?;
        // The child holds its own copy of the slave; ours would keep EOF from arriving.
        drop(pair.slave);

        let pid = child.process_id();
        info!("Started '{}' {:?} on a pty (pid {:?})", program, args, pid);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        // Taken up front so the child never sees stdin close.
        let input = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        let (output_tx, output_rx) = broadcast::channel(1024);
        let (request_tx, request_rx) = mpsc::channel(32);

        let pump_exited = exited.clone();
        std::thread::spawn(move || pump_output(reader, output_tx, pump_exited));

        let mut actor = Self {
            master: pair.master,
            input: Some(input),
            child,
            state: PtyState {
                running: true,
                pid,
                command: program.to_string(),
                args: args.to_vec(),
                rows: INITIAL_SIZE.rows,
                cols: INITIAL_SIZE.cols,
            },
            requests: request_rx,
            exited,
        };
        tokio::spawn(async move { actor.run().await });

        Ok((request_tx, output_rx))
    }

    async fn run(&mut self) {
        let exited = self.exited.clone();
        loop {
            let request = tokio::select! {
                request = self.requests.recv() => request,
                _ = exited.cancelled() => None,
            };
            match request {
                Some(PtyRequest::Write { bytes, reply }) => {
                    let _ = reply.send(self.write(&bytes));
                }
                Some(PtyRequest::Resize { size, reply }) => {
                    let _ = reply.send(self.resize(size));
                }
                Some(PtyRequest::State { reply }) => {
                    let _ = reply.send(self.state.clone());
                }
                Some(PtyRequest::Close { reply }) => {
                    self.close().await;
                    let _ = reply.send(());
                    break;
                }
                // Child exited, or every handle is gone and nobody can close us later.
                None => {
                    self.close().await;
                    break;
                }
            }
        }

        // Answer callers that raced with shutdown.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            match request {
                PtyRequest::Write { reply, .. } => {
                    let _ = reply.send(Err(anyhow!("PTY process has exited")));
                }
                PtyRequest::Resize { reply, .. } => {
                    let _ = reply.send(Err(anyhow!("PTY process has exited")));
                }
                PtyRequest::State { reply } => {
                    let _ = reply.send(self.state.clone());
                }
                PtyRequest::Close { reply } => {
                    let _ = reply.send(());
                }
            }
        }

        debug!("PTY actor for pid {:?} stopped", self.state.pid);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let input = self
            .input
            .as_mut()
            .filter(|_| self.state.running)
            .ok_or_else(|| anyhow!("PTY process has exited"))?;
        input.write_all(bytes).context("Failed to write to PTY")?;
        input.flush().context("Failed to flush PTY input")?;
        Ok(bytes.len())
    }

    fn resize(&mut self, size: PtySize) -> Result<()> {
        self.master.resize(size).context("Failed to resize PTY")?;
        self.state.rows = size.rows;
        self.state.cols = size.cols;
        Ok(())
    }

    /// SIGHUP first, SIGKILL after the grace period, then reap.
    async fn close(&mut self) {
        if !self.state.running {
            return;
        }
        self.input = None;

        #[cfg(unix)]
        if let Some(pid) = self.state.pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                debug!("SIGHUP to {} failed: {}", pid, e);
            }
        }

        let hung_up = tokio::time::timeout(CLOSE_GRACE, self.wait_for_exit()).await;
        if hung_up.is_err() {
            warn!("PTY child {:?} ignored SIGHUP, killing it", self.state.pid);
            if let Err(e) = self.child.kill() {
                warn!("Failed to kill PTY child: {}", e);
            }
            self.wait_for_exit().await;
        }

        self.state.running = false;
        self.state.pid = None;
    }

    async fn wait_for_exit(&mut self) {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!("PTY child exited with {:?}", status);
                    return;
                }
                Ok(None) => tokio::time::sleep(REAP_POLL).await,
                Err(e) => {
                    warn!("Failed to query PTY child status: {}", e);
                    return;
                }
            }
        }
    }
}
