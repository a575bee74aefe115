//! Frame-to-video conversion pipeline.
//!
//! Validates untrusted frame buffers, materializes them into a uniquely-named
//! temp workspace, and drives external encoder processes (ImageMagick for the
//! filmstrip, ffmpeg for mp4) concurrently. The workspace is removed when the
//! call finishes, whatever the outcome.

pub mod signature;

use crate::types::{MediaData, MediaVariants, OutputFormat};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::future;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

pub use signature::verify_jpeg_header;

/// Upper bound on frames per clip.
pub const MAX_FRAMES: usize = 100;

/// Hard wall-clock bound on the legacy split/re-encode path.
const SPLIT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("invalid frame format")]
    UnsupportedFormat,
    #[error("invalid frames")]
    InvalidFrames,
    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    EncoderFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("encode timed out")]
    Timeout,
    #[error("video split produced no frames")]
    EmptySplit,
}

impl MediaError {
    /// Error text surfaced to the sender in the chat ack. Encoder internals
    /// stay in the logs.
    pub fn ack_message(&self) -> String {
        match self {
            MediaError::UnsupportedFormat | MediaError::InvalidFrames => self.to_string(),
            _ => "unable to convert frames".to_string(),
        }
    }
}

fn input_ext(format: &str) -> Option<&'static str> {
    match format {
        "image/jpeg" => Some(".jpg"),
        "video/mp4" => Some(".mp4"),
        _ => None,
    }
}

pub struct MediaPipeline {
    tmp_root: PathBuf,
    accepted_inputs: Vec<String>,
    outputs: Vec<OutputFormat>,
    ffmpeg_bin: String,
    convert_bin: String,
}

impl MediaPipeline {
    pub fn new(
        tmp_root: PathBuf,
        accepted_inputs: Vec<String>,
        outputs: Vec<OutputFormat>,
        ffmpeg_bin: String,
        convert_bin: String,
    ) -> Self {
        Self {
            tmp_root,
            accepted_inputs,
            outputs,
            ffmpeg_bin,
            convert_bin,
        }
    }

    /// Validate a frame sequence against the declared format. Must pass
    /// before any encoder process is spawned.
    pub fn validate(&self, format: &str, frames: &[Vec<u8>]) -> Result<(), MediaError> {
        if !self.accepted_inputs.iter().any(|f| f == format) {
            return Err(MediaError::UnsupportedFormat);
        }
        if frames.is_empty() || frames.len() > MAX_FRAMES {
            return Err(MediaError::InvalidFrames);
        }
        if !frames.iter().all(|f| verify_jpeg_header(f)) {
            return Err(MediaError::InvalidFrames);
        }
        Ok(())
    }

    /// Encode a validated frame sequence into every configured output format.
    ///
    /// All encodes run concurrently; if any fails the whole call fails and no
    /// partial result is surfaced.
    pub async fn convert(
        &self,
        frames: &[Vec<u8>],
        format: &str,
    ) -> Result<MediaVariants, MediaError> {
        let ext = input_ext(format).ok_or(MediaError::UnsupportedFormat)?;
        let dir = self.workspace().await?;
        let result = self.convert_in(&dir, frames, ext).await;
        remove_workspace(&dir).await;
        result
    }

    async fn convert_in(
        &self,
        dir: &Path,
        frames: &[Vec<u8>],
        ext: &str,
    ) -> Result<MediaVariants, MediaError> {
        for (i, frame) in frames.iter().enumerate() {
            fs::write(dir.join(format!("{i}{ext}")), frame).await?;
        }

        let encodes = self
            .outputs
            .iter()
            .map(|output| self.encode(dir, ext, frames.len(), *output));

        let mut variants = MediaVariants::new();
        for result in future::join_all(encodes).await {
            let (format, data) = result?;
            variants.insert(format, data);
        }
        Ok(variants)
    }

    async fn encode(
        &self,
        dir: &Path,
        img_ext: &str,
        frame_count: usize,
        output: OutputFormat,
    ) -> Result<(OutputFormat, MediaData), MediaError> {
        match output {
            OutputFormat::Jpg => {
                let frames: Vec<PathBuf> = (0..frame_count)
                    .map(|i| dir.join(format!("{i}{img_ext}")))
                    .collect();
                let out = dir.join("output.jpg");
                self.filmstrip(&frames, &out).await?;
                Ok((OutputFormat::Jpg, MediaData::Bytes(fs::read(&out).await?)))
            }
            OutputFormat::Mp4 => {
                let out = dir.join("video.mp4");
                let mut args: Vec<OsString> = vec!["-i".into()];
                args.push(dir.join(format!("%d{img_ext}")).into());
                for arg in [
                    "-filter:v",
                    "setpts=2.5*PTS",
                    "-vcodec",
                    "libx264",
                    "-pix_fmt",
                    "yuv420p",
                    "-an",
                ] {
                    args.push(arg.into());
                }
                args.push(out.clone().into());
                run_command(&self.ffmpeg_bin, args).await?;
                let bytes = fs::read(&out).await?;
                let uri = format!("data:video/mp4;base64,{}", BASE64.encode(&bytes));
                Ok((OutputFormat::Mp4, MediaData::DataUri(uri)))
            }
        }
    }

    /// Vertically concatenate stills into one filmstrip image.
    async fn filmstrip(&self, frames: &[PathBuf], out: &Path) -> Result<(), MediaError> {
        let mut args: Vec<OsString> = vec!["-append".into()];
        for frame in frames {
            args.push(frame.clone().into());
        }
        args.push(out.to_path_buf().into());
        run_command(&self.convert_bin, args).await
    }

    /// Reverse operation for relaying legacy-format input: split an encoded
    /// video into frames and re-encode them as a filmstrip. The split is
    /// bounded by a hard wall-clock timeout.
    pub async fn refilmstrip(
        &self,
        video: &[u8],
        format: &str,
    ) -> Result<MediaVariants, MediaError> {
        let ext = match format {
            "video/mp4" => ".mp4",
            _ => return Err(MediaError::UnsupportedFormat),
        };
        let dir = self.workspace().await?;
        let result = self.refilmstrip_in(&dir, video, ext).await;
        remove_workspace(&dir).await;
        result
    }

    async fn refilmstrip_in(
        &self,
        dir: &Path,
        video: &[u8],
        ext: &str,
    ) -> Result<MediaVariants, MediaError> {
        let input = dir.join(format!("vid{ext}"));
        fs::write(&input, video).await?;

        let mut args: Vec<OsString> = vec!["-i".into(), input.into()];
        for arg in ["-filter:v", "setpts=0.4*PTS", "-qscale:v", "1"] {
            args.push(arg.into());
        }
        args.push(dir.join("frame%02d.jpg").into());

        let split = run_command(&self.ffmpeg_bin, args);
        match tokio::time::timeout(SPLIT_TIMEOUT, split).await {
            Ok(result) => result?,
            Err(_) => return Err(MediaError::Timeout),
        }

        let mut frames = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("frame") && name.ends_with(".jpg") {
                frames.push(entry.path());
            }
        }
        if frames.is_empty() {
            return Err(MediaError::EmptySplit);
        }
        frames.sort();

        let out = dir.join("output.jpg");
        self.filmstrip(&frames, &out).await?;
        let mut variants = MediaVariants::new();
        variants.insert(OutputFormat::Jpg, MediaData::Bytes(fs::read(&out).await?));
        Ok(variants)
    }

    /// Create a uniquely-named scoped workspace under the temp root.
    async fn workspace(&self) -> Result<PathBuf, MediaError> {
        let dir = self.tmp_root.join(ulid::Ulid::new().to_string());
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

async fn run_command(program: &str, args: Vec<OsString>) -> Result<(), MediaError> {
    // The split path can drop this future on timeout; without kill_on_drop
    // the encoder would keep running as an orphan.
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(MediaError::EncoderFailed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

async fn remove_workspace(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove temp workspace");
    }
}
