// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External command execution.
//!
//! Transfers are delegated to operator-configured shell command templates.
//! Placeholders (`%b`, `%s`, `%d`) are replaced with shell-quoted values and
//! the result is run through `/bin/sh -c`. A single child process is driven
//! concurrently on three fronts: stdin is fed in chunks, stderr is collected
//! line by line, and the exit status is awaited.
//!
//! Nothing runs unless the liveness checkfile exists, so an operator can stop
//! all transfers by removing one file.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

/// Maximum bytes written to the child's stdin per write.
pub const WRITE_CHUNK: usize = 8 * 1024;

/// How long to keep draining stderr after the child exited.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// `%b` value telling the command to read the batch list from stdin.
pub const STDIN_PLACEHOLDER: &str = "-";

/// Quote `value` for safe interpolation into a `/bin/sh` command line.
///
/// Values made only of unremarkable characters are left as they are.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c));
    if plain {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Replace each placeholder in `template` with its quoted value.
///
/// The template is scanned once, so values are never themselves rescanned
/// for placeholders.
pub fn substitute(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while !rest.is_empty() {
        for (key, value) in substitutions {
            if !key.is_empty() && rest.starts_with(key) {
                out.push_str(&shell_quote(value));
                rest = &rest[key.len()..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Fail unless the liveness checkfile is configured and present.
pub async fn check_liveness(checkfile: Option<&Path>) -> Result<()> {
    let path = checkfile.ok_or_else(|| SyncError::Config("No checkfile configured".to_string()))?;
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Ok(())
    } else {
        Err(SyncError::CheckfileMissing {
            path: path.to_path_buf(),
        })
    }
}

/// Runs command templates under the current configuration.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    checkfile: Option<PathBuf>,
    accept_status: Vec<i32>,
    dry_run: bool,
    debug: bool,
}

struct Finished {
    status: ExitStatus,
    written: usize,
    stderr: String,
}

impl CommandRunner {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            checkfile: config.checkfile.clone(),
            accept_status: config.accept_status.clone(),
            dry_run: config.dry_run,
            debug: config.debug,
        }
    }

    /// Substitute `template` and run it, feeding `input` on stdin.
    ///
    /// In dry-run mode the command is only logged.
    pub async fn execute(
        &self,
        template: &str,
        substitutions: &[(&str, &str)],
        input: &[u8],
    ) -> Result<()> {
        check_liveness(self.checkfile.as_deref()).await?;

        let command = substitute(template, substitutions);
        if self.debug {
            info!(command = %command, input_size = input.len(), "Executing command");
        }
        if self.dry_run {
            return Ok(());
        }

        let started = Instant::now();
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .stdin(if input.is_empty() { Stdio::null() } else { Stdio::piped() })
            .stdout(if self.debug { Stdio::inherit() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(command = %command, error = %e, "Unable to execute command");
                SyncError::Spawn {
                    command: command.clone(),
                    source: e,
                }
            })?;

        let finished = drive(&mut child, input)
            .await
            .map_err(|e| SyncError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if finished.written != input.len() {
            error!(
                command = %command,
                expected = input.len(),
                written = finished.written,
                "Stdin length mismatch, command did not read all batches"
            );
            crate::metrics::record_stdin_mismatch();
        }

        let status = finished.status.code().unwrap_or(-1);
        let accepted = self.accept_status.contains(&status);
        crate::metrics::record_command(started.elapsed(), accepted);

        if accepted {
            debug!(command = %command, status, "Command succeeded");
            Ok(())
        } else {
            error!(
                command = %command,
                status,
                input_size = input.len(),
                stderr = %finished.stderr,
                "Command failed"
            );
            Err(SyncError::CommandFailed {
                command,
                status,
                stderr: finished.stderr,
            })
        }
    }
}

/// Write the next chunk, or never complete once stdin is closed.
async fn write_chunk(stdin: &mut Option<ChildStdin>, data: &[u8]) -> std::io::Result<usize> {
    match stdin {
        Some(pipe) => pipe.write(&data[..data.len().min(WRITE_CHUNK)]).await,
        None => std::future::pending().await,
    }
}

async fn drive(child: &mut Child, input: &[u8]) -> std::io::Result<Finished> {
    let mut stdin = child.stdin.take();
    let mut stderr = child.stderr.take().map(BufReader::new);
    let mut collected = Vec::new();
    let mut line = Vec::new();
    let mut written = 0;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,

            res = write_chunk(&mut stdin, &input[written..]), if stdin.is_some() => match res {
                Ok(n) => {
                    written += n;
                    if n == 0 || written == input.len() {
                        // Closing the pipe signals end of input.
                        stdin = None;
                    }
                }
                Err(e) => {
                    debug!(error = %e, written, "Command closed stdin early");
                    stdin = None;
                }
            },

            res = async {
                match stderr.as_mut() {
                    Some(reader) => reader.read_until(b'\n', &mut line).await,
                    None => std::future::pending().await,
                }
            }, if stderr.is_some() => match res {
                Ok(0) | Err(_) => stderr = None,
                Ok(_) => collected.append(&mut line),
            },
        }
    };
    drop(stdin);

    if let Some(mut reader) = stderr {
        collected.append(&mut line);
        let _ = tokio::time::timeout(IDLE_INTERVAL, reader.read_to_end(&mut collected)).await;
    }

    Ok(Finished {
        status,
        written,
        stderr: String::from_utf8_lossy(&collected).trim_end().to_string(),
    })
}
