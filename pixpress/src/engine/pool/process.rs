//! Process-backed execution units.
//!
//! Each unit is a child process (by default `pixpress unit`) that reads
//! [`UnitRequest`]s as JSON lines on stdin and writes [`UnitReply`]s as JSON
//! lines on stdout. End of stdout means the unit exited.

use process_utils::{PipedChild, spawn_piped};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::protocol::{UnitReply, UnitRequest, execute_request};
use super::{UnitLink, UnitSpawner};
use crate::codec::CodecRegistry;
use crate::config::PoolKind;
use crate::error::Result;

/// How long an exiting unit gets before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Command line used to start one process unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessUnitCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessUnitCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `<current executable> unit`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("unit"))
    }
}

/// Runs each unit as a child process.
pub struct ProcessSpawner {
    command: ProcessUnitCommand,
}

impl ProcessSpawner {
    pub fn new(command: ProcessUnitCommand) -> Self {
        Self { command }
    }
}

impl UnitSpawner for ProcessSpawner {
    fn kind(&self) -> PoolKind {
        PoolKind::Process
    }

    fn spawn(&self, unit_id: usize) -> Result<UnitLink> {
        let PipedChild {
            mut child,
            mut stdin,
            stdout,
        } = spawn_piped(&self.command.program, &self.command.args)?;
        debug!(unit_id, pid = ?child.id(), program = %self.command.program.display(), "Started process unit");

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<UnitRequest>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<UnitReply>();

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let mut line = match serde_json::to_vec(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(unit_id, error = %e, "Failed to encode unit request");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    debug!(unit_id, error = %e, "Process unit stdin closed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            // Dropping stdin closes the pipe and the unit exits on EOF.
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<UnitReply>(&line) {
                            Ok(reply) => {
                                if reply_tx.send(reply).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(unit_id, error = %e, "Ignoring malformed process unit output")
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(unit_id, error = %e, "Failed to read process unit output");
                        break;
                    }
                }
            }

            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(unit_id, "Process unit exited")
                }
                Ok(Ok(status)) => warn!(unit_id, %status, "Process unit exited abnormally"),
                Ok(Err(e)) => warn!(unit_id, error = %e, "Failed to wait for process unit"),
                Err(_) => {
                    warn!(unit_id, "Process unit did not exit in time; killing it");
                    let _ = child.kill().await;
                }
            }
            // reply_tx drops here, which tells the pool the unit is gone.
        });

        Ok(UnitLink {
            requests: request_tx,
            replies: reply_rx,
        })
    }
}

/// Serve unit requests over stdin/stdout until stdin closes.
///
/// This is the body of `pixpress unit`. Nothing but protocol messages may be
/// written to stdout.
pub fn run_unit_stdio(registry: &CodecRegistry) -> Result<()> {
    let stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();

    write_reply(&mut stdout, &UnitReply::Ready)?;

    for line in stdin.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: UnitRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed unit request");
                continue;
            }
        };

        debug!(job_id = %request.job_id, task_kind = %request.task_kind, "Unit executing request");
        let reply = execute_request(registry, request, |progress| {
            if let Err(e) = write_reply(&mut stdout, &progress) {
                warn!(error = %e, "Failed to write progress");
            }
        });
        write_reply(&mut stdout, &reply)?;
    }

    Ok(())
}

fn write_reply(out: &mut impl Write, reply: &UnitReply) -> Result<()> {
    serde_json::to_writer(&mut *out, reply)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
