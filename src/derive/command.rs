//! Preview derivation by shelling out to `ffmpeg` and ImageMagick.
//!
//! Videos become a short, silent MP4 clip; images become a JPEG.  Both are
//! scaled so the longer edge is at most `max_dimension` pixels.  Tools run
//! with `kill_on_drop` under a timeout, so a cancelled or stuck derivation
//! never leaves a process behind.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{DerivedArtifact, Deriver, MediaKind};
use crate::config::DeriveConfig;
use crate::errors::SyncError;

/// [`Deriver`] backed by external command-line tools.
#[derive(Debug, Clone)]
pub struct CommandDeriver {
    ffmpeg: String,
    magick: String,
    timeout: Duration,
    clip_seconds: u32,
    max_dimension: u32,
    /// Fetches presigned sources for tools that only read local files.
    http: reqwest::Client,
}

impl CommandDeriver {
    pub fn new(config: &DeriveConfig) -> Result<Self, SyncError> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Derivation(anyhow::anyhow!("building HTTP client: {e}")))?;
        Ok(Self {
            ffmpeg: config.ffmpeg.clone(),
            magick: config.magick.clone(),
            timeout,
            clip_seconds: config.clip_seconds,
            max_dimension: config.max_dimension,
            http,
        })
    }

    /// Names of configured tools that cannot be found on `PATH`.
    pub fn missing_tools(&self) -> Vec<&str> {
        [self.ffmpeg.as_str(), self.magick.as_str()]
            .into_iter()
            .filter(|tool| which::which(tool).is_err())
            .collect()
    }

    /// Arguments for a silent clip capped at `max_dimension` on its longer
    /// edge; `-2` keeps the other edge even, as H.264 requires.
    fn video_args(&self, source: &str, output: &Path) -> Vec<String> {
        let d = self.max_dimension;
        vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            source.to_string(),
            "-t".to_string(),
            self.clip_seconds.to_string(),
            "-an".to_string(),
            "-vf".to_string(),
            format!("scale='if(gt(iw,ih),{d},-2)':'if(gt(iw,ih),-2,{d})'"),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Arguments for a JPEG that only ever shrinks the source.
    fn image_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let d = self.max_dimension;
        vec![
            // First frame only, for animated or multi-page inputs.
            format!("{}[0]", input.to_string_lossy()),
            "-auto-orient".to_string(),
            "-resize".to_string(),
            format!("{d}x{d}>"),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn derive_video(&self, source: &str, dir: &Path) -> Result<PathBuf, SyncError> {
        let output = dir.join("preview.mp4");
        run_tool(&self.ffmpeg, &self.video_args(source, &output), self.timeout).await?;
        Ok(output)
    }

    async fn derive_image(
        &self,
        source: &str,
        content_type: &str,
        dir: &Path,
    ) -> Result<PathBuf, SyncError> {
        let input = if is_remote(source) {
            let ext = mime_guess::get_mime_extensions_str(content_type)
                .and_then(|exts| exts.first())
                .copied()
                .unwrap_or("img");
            let path = dir.join(format!("source.{ext}"));
            self.download(source, &path).await?;
            path
        } else {
            PathBuf::from(source)
        };
        let output = dir.join("preview.jpg");
        run_tool(&self.magick, &self.image_args(&input, &output), self.timeout).await?;
        Ok(output)
    }

    /// Fetch `url` into `dest`.  The whole exchange, body included, is
    /// bounded by the derivation timeout.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), SyncError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Derivation(anyhow::anyhow!("fetching source: {e}")))?;
        let data = response
            .bytes()
            .await
            .map_err(|e| SyncError::Derivation(anyhow::anyhow!("reading source: {e}")))?;
        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| SyncError::Derivation(e.into()))?;
        Ok(())
    }
}

impl Deriver for CommandDeriver {
    fn create<'a>(
        &'a self,
        source: &'a str,
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DerivedArtifact, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let kind = MediaKind::classify(content_type)?;
            let dir = tempfile::Builder::new()
                .prefix("photostash-derive-")
                .tempdir()
                .map_err(|e| SyncError::Derivation(e.into()))?;

            let path = match kind {
                MediaKind::Video => self.derive_video(source, dir.path()).await?,
                MediaKind::Image => self.derive_image(source, content_type, dir.path()).await?,
            };

            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(SyncError::Derivation(anyhow::anyhow!(
                    "tool exited successfully but produced no output"
                )));
            }
            Ok(DerivedArtifact::new(dir, path, kind))
        })
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Run `program` to completion, killing it if `timeout` elapses.
async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<(), SyncError> {
    which::which(program)
        .map_err(|_| SyncError::Derivation(anyhow::anyhow!("{program} not found on PATH")))?;

    debug!("running {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SyncError::Derivation(anyhow::anyhow!("spawning {program}: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| SyncError::Derivation(e.into()))?,
        Err(_) => {
            // Dropping the wait future drops the child, which kills it.
            warn!("{} timed out after {:?}, killed", program, timeout);
            return Err(SyncError::Derivation(anyhow::anyhow!(
                "{program} timed out after {timeout:?}"
            )));
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(5)..].join("\n");
    Err(SyncError::Derivation(anyhow::anyhow!(
        "{program} exited with {}: {tail}",
        output.status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> CommandDeriver {
        CommandDeriver::new(&DeriveConfig::default()).unwrap()
    }

    #[test]
    fn test_video_args_bound_longer_edge() {
        let args = deriver().video_args("https://s3/x.mov", Path::new("/tmp/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-i https://s3/x.mov"));
        assert!(joined.contains("-t 3"));
        assert!(args.contains(&"-an".to_string()));
        assert!(joined.contains("scale='if(gt(iw,ih),256,-2)':'if(gt(iw,ih),-2,256)'"));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn test_image_args_only_shrink() {
        let args = deriver().image_args(Path::new("/tmp/in.heic"), Path::new("/tmp/out.jpg"));
        assert_eq!(args[0], "/tmp/in.heic[0]");
        assert!(args.contains(&"256x256>".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out.jpg");
    }

    #[tokio::test]
    async fn test_unsupported_type_runs_nothing() {
        let err = deriver().create("/tmp/readme.txt", "text/plain").await.unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedMediaType { .. }));
    }

    #[tokio::test]
    async fn test_missing_tool_is_a_derivation_error() {
        let err = run_tool("photostash-no-such-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Derivation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_a_derivation_error() {
        let err = run_tool("false", &[], Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_the_tool() {
        let started = std::time::Instant::now();
        let err = run_tool("sleep", &["10".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stalled_download_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let deriver = CommandDeriver::new(&DeriveConfig {
            timeout_seconds: 1,
            ..DeriveConfig::default()
        })
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = deriver
            .download(&format!("http://{addr}/origin/a.jpg"), &dir.path().join("a.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Derivation(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!dir.path().join("a.jpg").exists());
    }

    #[test]
    fn test_remote_detection() {
        assert!(is_remote("https://storage.example/a.jpg?X-Amz-Expires=900"));
        assert!(!is_remote("/var/lib/photostash/photos/origin/a.jpg"));
        assert!(!is_remote("memory://photos/origin/a.jpg"));
    }
}
