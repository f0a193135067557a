//! Agent side of an interactive terminal.
//!
//! A terminal task opens a second WebSocket to
//! `/api/agent/stream/{stream_id}` and bridges it to a shell on a fresh PTY.
//! The dashboard relays bytes without looking at them, so the framing here
//! is the browser's:
//!
//! | First byte | Rest                        |
//! |------------|-----------------------------|
//! | `0x00`     | keystrokes for the shell    |
//! | `0x01`     | `{"cols": u16, "rows": u16}` |
//!
//! Shell output goes back as unframed binary messages. With `record` set the
//! session is written to a local recording and uploaded once the shell ends.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::audit::wrapper;
use super::{AgentContext, AgentError};
use crate::recording::{Recorder, RecordingError};
use crate::shell::default_shell;
use crate::shell::pty::{allocate_pty, signal_group, spawn_shell_pty, PtyIo, PtyPair, ShellCommand};
use crate::task::TerminalTask;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

const FRAME_INPUT: u8 = 0x00;
const FRAME_RESIZE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("stream connect failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("pty error: {0}")]
    Pty(#[from] nix::Error),
    #[error("shell io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct Resize {
    cols: u16,
    rows: u16,
}

#[derive(Debug, PartialEq, Eq)]
enum Frame<'a> {
    Input(&'a [u8]),
    Resize(Resize),
    Ignored,
}

fn parse_frame(data: &[u8]) -> Frame<'_> {
    match data.split_first() {
        Some((&FRAME_INPUT, rest)) if !rest.is_empty() => Frame::Input(rest),
        Some((&FRAME_RESIZE, rest)) => match serde_json::from_slice::<Resize>(rest) {
            Ok(size) if size.cols > 0 && size.rows > 0 => Frame::Resize(size),
            _ => Frame::Ignored,
        },
        _ => Frame::Ignored,
    }
}

fn shell_env(ctx: &AgentContext, stream_id: &str) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("FLEETCTL_STREAM_ID".to_string(), stream_id.to_string()),
    ]);
    if let Some(url) = &ctx.relay_url {
        env.insert("FLEETCTL_AUDIT_URL".to_string(), url.clone());
        env.insert(
            "FLEETCTL_AUDIT_TIMEOUT".to_string(),
            ctx.config.audit_timeout_secs.to_string(),
        );
    }
    env
}

fn working_dir(configured: Option<&str>) -> String {
    configured
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("HOME").ok().filter(|h| Path::new(h).is_dir()))
        .unwrap_or_else(|| "/".to_string())
}

/// Serve one terminal task until the shell exits or the stream closes.
pub async fn run(ctx: AgentContext, task: TerminalTask) -> Result<(), TerminalError> {
    let url = ctx.stream_url(&task.stream_id)?;
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let pty = allocate_pty(DEFAULT_ROWS, DEFAULT_COLS)?;
    let shell = default_shell(ctx.config.shell.as_deref());
    let args = wrapper::shell_args(&shell, ctx.wrapper.as_deref());
    let env = shell_env(&ctx, &task.stream_id);
    let cwd = working_dir(ctx.config.working_dir.as_deref());
    let mut child = spawn_shell_pty(
        &pty,
        &ShellCommand {
            program: &shell,
            args: &args,
            working_dir: &cwd,
            env: &env,
        },
    )?;
    let PtyPair { master, slave } = pty;
    drop(slave);
    let mut io = PtyIo::split(master)?;
    info!(stream_id = %task.stream_id, "Terminal started: {shell} (pid {:?})", child.id());

    let recorder = if task.record {
        match Recorder::create(
            Path::new(&ctx.config.recordings_dir),
            &task.stream_id,
            DEFAULT_COLS,
            DEFAULT_ROWS,
        ) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!(stream_id = %task.stream_id, "Recording disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            read = io.reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Some(recorder) = &recorder {
                    record(recorder.write_output(&buf[..n]));
                }
                if sink.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                match parse_frame(&data) {
                    Frame::Input(input) => {
                        if let Some(recorder) = &recorder {
                            record(recorder.write_input(input));
                        }
                        if io.writer.write_all(input).await.is_err() {
                            break;
                        }
                    }
                    Frame::Resize(size) => {
                        if let Err(e) = io.resize(size.rows, size.cols) {
                            debug!("Resize failed: {e}");
                        }
                    }
                    Frame::Ignored => {}
                }
            }
        }
    }

    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGHUP);
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    let _ = sink.send(Message::Close(None)).await;
    info!(stream_id = %task.stream_id, "Terminal closed");

    if let Some(recorder) = recorder {
        match recorder.close().await {
            Ok(path) => {
                let audit = ctx.audit.clone();
                let stream_id = task.stream_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = audit.upload_recording(&stream_id, &path).await {
                        warn!(stream_id = %stream_id, "Recording upload failed, kept {}: {e}", path.display());
                    }
                });
            }
            Err(e) => warn!(stream_id = %task.stream_id, "Recording not finalized: {e}"),
        }
    }
    Ok(())
}

fn record(result: Result<(), RecordingError>) {
    if let Err(e) = result {
        debug!("Recording write dropped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::audit::AuditClient;
    use crate::config::AgentConfig;
    use std::sync::Arc;

    #[test]
    fn input_frame() {
        assert_eq!(parse_frame(b"\x00ls\r"), Frame::Input(b"ls\r"));
    }

    #[test]
    fn resize_frame() {
        assert_eq!(
            parse_frame(b"\x01{\"cols\":120,\"rows\":40}"),
            Frame::Resize(Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn junk_frames_are_ignored() {
        assert_eq!(parse_frame(b""), Frame::Ignored);
        assert_eq!(parse_frame(b"\x00"), Frame::Ignored);
        assert_eq!(parse_frame(b"\x01{\"cols\":0,\"rows\":0}"), Frame::Ignored);
        assert_eq!(parse_frame(b"\x01not json"), Frame::Ignored);
        assert_eq!(parse_frame(b"\x07bell"), Frame::Ignored);
    }

    #[test]
    fn audit_env_only_with_relay() {
        let mut ctx = AgentContext {
            config: Arc::new(AgentConfig::default()),
            audit: AuditClient::new("http://127.0.0.1:1", "t", Duration::from_secs(1)).unwrap(),
            relay_url: None,
            wrapper: None,
        };
        let env = shell_env(&ctx, "abc");
        assert_eq!(env["FLEETCTL_STREAM_ID"], "abc");
        assert!(!env.contains_key("FLEETCTL_AUDIT_URL"));

        ctx.relay_url = Some("http://127.0.0.1:4000".into());
        let env = shell_env(&ctx, "abc");
        assert_eq!(env["FLEETCTL_AUDIT_URL"], "http://127.0.0.1:4000");
        assert_eq!(env["FLEETCTL_AUDIT_TIMEOUT"], "10");
    }

    #[test]
    fn configured_working_dir_wins() {
        assert_eq!(working_dir(Some("/srv")), "/srv");
        assert!(!working_dir(None).is_empty());
    }
}
