//! Decodes arbitrary media inputs to raw PCM by piping them through an
//! external `ffmpeg` process. Anything ffmpeg can demux and decode can be
//! played back; we only ever ask it for one fixed output shape.

use std::path::Path;
use std::process::Stdio;

use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

pub mod pcm;

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ffmpeg exited with {0}")]
    Ffmpeg(std::process::ExitStatus),
    #[error("input produced no audio")]
    Empty,
}

fn base_command(sample_rate: u32) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.kill_on_drop(true);
    cmd.stderr(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg("-")
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(format!("{}", sample_rate))
        .arg("-");
    cmd
}

/// Decodes a media file to mono 16-bit PCM at `sample_rate`.
pub async fn read_file(path: impl AsRef<Path>, sample_rate: u32) -> Result<Vec<i16>> {
    let path = path.as_ref();
    debug!("decoding file {}", path.display());

    let mut cmd = Command::new("ffmpeg");
    cmd.kill_on_drop(true);
    cmd.stderr(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd
        .arg("-nostdin")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(path)
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(format!("{}", sample_rate))
        .arg("-");

    let mut child = cmd.spawn()?;

    let mut raw = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_end(&mut raw).await?;
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(DecodeError::Ffmpeg(status));
    }

    finish(raw)
}

/// Decodes an in-memory media buffer to mono 16-bit PCM at `sample_rate`.
///
/// `name` only identifies the input in log output; ffmpeg probes the format
/// from the data itself.
pub async fn read_buffer(name: &str, data: &[u8], sample_rate: u32) -> Result<Vec<i16>> {
    debug!("decoding buffer {} ({} bytes)", name, data.len());

    let mut cmd = base_command(sample_rate);
    cmd.stdin(Stdio::piped());

    let mut child = cmd.spawn()?;

    let mut stdin = child.stdin.take();
    let data = data.to_vec();
    let feed = async {
        if let Some(stdin) = &mut stdin {
            // ffmpeg may stop reading early once it has seen the whole
            // stream; a broken pipe here is not a decode failure
            if let Err(e) = stdin.write_all(&data).await {
                warn!("short write to ffmpeg: {}", e);
            }
        }
        drop(stdin.take());
    };

    let mut raw = Vec::new();
    let mut stdout = child.stdout.take();
    let drain = async {
        match &mut stdout {
            Some(stdout) => stdout.read_to_end(&mut raw).await.map(|_| ()),
            None => Ok(()),
        }
    };

    let (_, read) = tokio::join!(feed, drain);
    read?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(DecodeError::Ffmpeg(status));
    }

    finish(raw)
}

fn finish(raw: Vec<u8>) -> Result<Vec<i16>> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(pcm::from_s16le(&raw))
}
