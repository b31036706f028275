use anyhow::{Context, Result};
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the external transcoder is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxJob {
    /// fMP4 in, MPEG-TS out, audio and video copied. One per TS client.
    CopyToMpegTs,
    /// WebM in, fMP4 out, video copied, audio transcoded to AAC. Feeds the
    /// segmenter when the tab capture cannot produce fMP4 natively.
    WebmToFmp4 { audio_bitrate: u32 },
}

fn args_for(job: RemuxJob) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    match job {
        RemuxJob::CopyToMpegTs => {
            args.extend(
                ["-i", "pipe:0", "-c", "copy", "-f", "mpegts", "pipe:1"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        RemuxJob::WebmToFmp4 { audio_bitrate } => {
            args.extend(
                ["-f", "webm", "-i", "pipe:0", "-c:v", "copy", "-c:a", "aac", "-b:a"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            args.push(audio_bitrate.to_string());
            args.extend(
                [
                    "-f",
                    "mp4",
                    "-movflags",
                    "+frag_keyframe+empty_moov+default_base_moof",
                    "pipe:1",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
        }
    }
    args
}

/// A running ffmpeg remux process with piped stdin/stdout.
pub struct Remuxer {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    killed: bool,
}

impl Remuxer {
    pub fn spawn(ffmpeg_path: &str, job: RemuxJob) -> Result<Self> {
        let args = args_for(job);
        debug!("spawning {} {}", ffmpeg_path, args.join(" "));
        let mut child = Command::new(ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", ffmpeg_path))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            killed: false,
        })
    }

    /// Take the write side. Panics if taken twice.
    pub fn take_stdin(&mut self) -> ChildStdin {
        self.stdin.take().expect("remuxer stdin already taken")
    }

    /// Take the read side. Panics if taken twice.
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("remuxer stdout already taken")
    }

    /// Stop the process. Idempotent; a process that already exited is fine.
    pub async fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            debug!("remuxer kill: {}", e);
        }
    }
}

/// Feed capture bytes into a remuxer's stdin until the source ends, the
/// token fires, or the write side fails. Always shuts the writer down on the
/// way out so the process sees EOF and can exit.
pub async fn pump<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                if let Err(e) = writer.write_all(&chunk).await {
                    warn!("remuxer stdin write failed: {}", e);
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
