//! The interactive agent session watched by the coordinator

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CommanderError, Result};
use crate::pid;
use crate::signals::{SessionSignal, SignalTranslator};

const STOP_GRACE: Duration = Duration::from_secs(2);
/// Feedback messages queued for a session that is not reading its input
const INPUT_BACKLOG: usize = 32;
/// How long to keep reading buffered output once the session has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Signal(SessionSignal),
    /// The session process ended on its own
    Exited(Option<i32>),
}

pub struct InteractiveSession {
    input: mpsc::Sender<String>,
    pid: Option<u32>,
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl InteractiveSession {
    /// Spawn the session; signals and its exit are reported on `events`
    pub fn spawn(
        command: &[String],
        env: &[(String, String)],
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CommanderError::Session("Session command is empty".to_string()))?;

        let mut translator = SignalTranslator::new()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("MEMENTO_MODE", "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CommanderError::Session(format!("Failed to spawn {}: {}", program, e)))?;
        let pid = child.id();
        info!(?pid, "Interactive session started: {}", program);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CommanderError::Session("Failed to capture stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommanderError::Session("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("session stderr: {}", line);
                }
            });
        }

        let stop = CancellationToken::new();
        let (input, pending_input) = mpsc::channel(INPUT_BACKLOG);
        let writer = tokio::spawn(write_input(stdin, pending_input, stop.clone()));

        let stop_requested = stop.clone();
        let supervisor = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut stdout_open = true;

            let forward = |signals: Vec<SessionSignal>| {
                for signal in signals {
                    debug!(?signal, "Session signal");
                    let _ = events.send(SessionEvent::Signal(signal));
                }
            };

            let code = loop {
                tokio::select! {
                    read = stdout.read(&mut buf), if stdout_open => match read {
                        Ok(0) | Err(_) => {
                            stdout_open = false;
                            forward(translator.finish());
                        }
                        Ok(n) => forward(translator.push(&buf[..n])),
                    },
                    status = child.wait() => break status.ok().and_then(|s| s.code()),
                    _ = stop_requested.cancelled() => {
                        pid::stop_child(&mut child, STOP_GRACE).await;
                        return;
                    }
                }
            };

            if stdout_open {
                let mut rest = Vec::new();
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, stdout.read_to_end(&mut rest)).await;
                forward(translator.push(&rest));
                forward(translator.finish());
            }

            let _ = events.send(SessionEvent::Exited(code));
        });

        Ok(Self {
            input,
            pid,
            stop,
            supervisor,
            writer,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue text for the session's input without waiting for it to be read.
    ///
    /// Fails when the backlog is full or the input has been closed; the text
    /// is dropped in both cases.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.input.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CommanderError::Session("Session is not reading its input, feedback dropped".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CommanderError::Session("Session input is closed".to_string())
            }
        })
    }

    /// Terminate the session and wait for it to go away
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.supervisor.await {
            warn!("Session supervisor ended abnormally: {}", e);
        }
        if let Err(e) = self.writer.await {
            warn!("Session writer ended abnormally: {}", e);
        }
        info!("Interactive session stopped");
    }
}

/// Drain queued feedback into the session's stdin until it closes or we stop
async fn write_input(
    mut stdin: ChildStdin,
    mut pending: mpsc::Receiver<String>,
    stop: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = stop.cancelled() => return,
            text = pending.recv() => match text {
                Some(text) => text,
                None => return,
            },
        };
        let written = tokio::select! {
            _ = stop.cancelled() => return,
            written = async {
                stdin.write_all(text.as_bytes()).await?;
                stdin.flush().await
            } => written,
        };
        if let Err(e) = written {
            warn!("Failed to write to session: {}", e);
            return;
        }
    }
}
