//! Agent process management

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::event::{AgentEvent, OutputStream};

const READ_CHUNK: usize = 4096;

/// Program and arguments used to start an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Build from a `[program, args...]` list as stored in the config file
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| ExecutorError::InvalidAgentCommand {
                command: argv.to_vec(),
            })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// Configuration for an agent process
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: AgentCommand,
    /// Working directory for the agent (inherits ours when unset)
    pub working_dir: Option<PathBuf>,
    /// Instruction written to the agent's stdin
    pub instruction: String,
    /// Additional environment variables
    pub env: Vec<(String, String)>,
}

/// Represents a running agent process
pub struct AgentProcess {
    /// The child process
    child: Child,
    /// Event sender
    event_tx: mpsc::Sender<AgentEvent>,
}

impl AgentProcess {
    /// Spawn a new agent process and feed it the instruction
    pub async fn spawn(config: AgentConfig, event_tx: mpsc::Sender<AgentEvent>) -> Result<Self> {
        let command = &config.command;

        info!(
            "Spawning {} with instruction: {}",
            command.program,
            config.instruction.chars().take(100).collect::<String>()
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        // Add environment variables
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::spawn_failed_with_source(
                format!("Failed to spawn {}: {}", command.program, e),
                e,
            )
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdin"))?;

        // Written from a separate task so a chatty agent can't deadlock us
        let instruction = config.instruction;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(instruction.as_bytes()).await {
                warn!("Failed to write instruction to agent: {}", e);
            }
            // Dropping stdin closes it, signalling end of instruction
            let _ = stdin.shutdown().await;
        });

        Ok(Self { child, event_tx })
    }

    /// Start reading output from the process
    pub async fn start_output_reader(mut self) -> Result<OutputReaderHandle> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdout"))?;

        let stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stderr"))?;

        // Stdout is forwarded in raw fragments; the result scanner reassembles them
        let stdout_tx = self.event_tx.clone();
        let stdout_handle = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; READ_CHUNK];
            let mut decoder = Utf8Decoder::default();

            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Failed to read agent stdout: {}", e);
                        break;
                    }
                };
                let content = decoder.decode(&buf[..n]);
                if content.is_empty() {
                    continue;
                }
                let event = AgentEvent::Output {
                    stream: OutputStream::Stdout,
                    content,
                };
                if stdout_tx.send(event).await.is_err() {
                    warn!("Event channel closed, stopping stdout reader");
                    return;
                }
            }

            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = stdout_tx
                    .send(AgentEvent::Output {
                        stream: OutputStream::Stdout,
                        content: rest,
                    })
                    .await;
            }
            let _ = stdout_tx
                .send(AgentEvent::StreamClosed {
                    stream: OutputStream::Stdout,
                })
                .await;
        });

        let stderr_tx = self.event_tx;
        let stderr_handle = tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stderr: {}", line);

                let event = AgentEvent::Output {
                    stream: OutputStream::Stderr,
                    content: line,
                };
                if stderr_tx.send(event).await.is_err() {
                    warn!("Event channel closed, stopping stderr reader");
                    return;
                }
            }
            let _ = stderr_tx
                .send(AgentEvent::StreamClosed {
                    stream: OutputStream::Stderr,
                })
                .await;
        });

        Ok(OutputReaderHandle {
            child: self.child,
            stdout_handle,
            stderr_handle,
        })
    }
}

/// Handle for the output reader tasks
pub struct OutputReaderHandle {
    child: Child,
    stdout_handle: tokio::task::JoinHandle<()>,
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl OutputReaderHandle {
    /// Wait for the process to exit. Cancel safe.
    ///
    /// Returns `None` as the code when the process was terminated by a signal.
    pub async fn wait_exit(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Kill the process and stop the readers
    pub async fn kill(&mut self) -> Result<()> {
        if let Err(e) = self.child.kill().await {
            // Already exited is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        self.stdout_handle.abort();
        self.stderr_handle.abort();
        Ok(())
    }

    /// Get the process ID
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Decodes UTF-8 across read boundaries so multi-byte characters split
/// between two reads are not mangled
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete trailing sequence: hold it back for the next read
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return out;
            }
        };
        let rest = self.pending.split_off(valid);
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        out
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
