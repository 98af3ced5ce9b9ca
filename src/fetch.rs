use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::{fs, process::Command};
use tracing::{info, warn};

use crate::{
    artifact_store::{delete_file_if_exists, ensure_dir, sanitize_component},
    config::Config,
    identity::Platform,
};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_url: String,
    pub variant_id: String,
    pub resource_id: String,
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub title: Option<String>,
    pub resolution: Option<String>,
}

/// Boundary to the external extractor. Implementations must tolerate
/// concurrent calls from multiple workers; every error is terminal for
/// the calling job, retries live below this seam if anywhere.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia>;
}

/// Shells out to yt-dlp. One subprocess per fetch, merged to mp4, output
/// named after the resource identity so the artifact can be located
/// without parsing extractor output.
pub struct YtDlpFetcher {
    binary: PathBuf,
    download_dir: PathBuf,
    proxy_url: Option<String>,
}

impl YtDlpFetcher {
    pub fn new(config: &Config) -> Self {
        let binary = config
            .ytdlp_path
            .clone()
            .unwrap_or_else(Self::resolve_binary);
        Self {
            binary,
            download_dir: config.download_dir.clone(),
            proxy_url: config.proxy_url.clone(),
        }
    }

    fn resolve_binary() -> PathBuf {
        let pinned = Path::new("/usr/local/bin/yt-dlp");
        if pinned.exists() {
            return pinned.to_path_buf();
        }
        // Fall back to PATH resolution at spawn time.
        PathBuf::from("yt-dlp")
    }

    fn output_prefix(request: &FetchRequest) -> String {
        format!(
            "{}_{}",
            sanitize_component(&request.resource_id),
            sanitize_component(&request.variant_id)
        )
    }

    async fn locate_output(&self, prefix: &str) -> Result<PathBuf> {
        let mut dir = fs::read_dir(&self.download_dir)
            .await
            .with_context(|| format!("Failed to list {}", self.download_dir.display()))?;

        while let Some(dent) = dir.next_entry().await? {
            let name = dent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && !name.ends_with(".part") {
                return Ok(dent.path());
            }
        }
        bail!("yt-dlp reported success but no output file matches {prefix}*");
    }

    /// Sweeps `.part` leftovers after a failed run so a retry of the same
    /// resource starts from a clean slate.
    async fn cleanup_partials(&self, prefix: &str) {
        let Ok(mut dir) = fs::read_dir(&self.download_dir).await else {
            return;
        };
        while let Ok(Some(dent)) = dir.next_entry().await {
            let name = dent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix) && name.ends_with(".part") {
                if let Err(err) = delete_file_if_exists(&dent.path()).await {
                    warn!("Failed to remove partial download: {err:#}");
                }
            }
        }
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia> {
        ensure_dir(&self.download_dir).await?;

        let prefix = Self::output_prefix(request);
        let template = self.download_dir.join(format!("{prefix}.%(ext)s"));

        let mut args: Vec<String> = vec![
            "--format".into(),
            format!("{}+bestaudio/best", request.variant_id),
            "--output".into(),
            template.to_string_lossy().into_owned(),
            "--no-playlist".into(),
            "--max-filesize".into(),
            "2G".into(),
            "--socket-timeout".into(),
            "60".into(),
            "--retries".into(),
            "5".into(),
            "--force-overwrites".into(),
            "--merge-output-format".into(),
            "mp4".into(),
        ];
        if let Some(proxy) = &self.proxy_url {
            args.push("--proxy".into());
            args.push(proxy.clone());
        }
        args.push(request.source_url.clone());

        info!(
            resource_id = %request.resource_id,
            variant_id = %request.variant_id,
            binary = %self.binary.display(),
            "Invoking extractor"
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no extractor output");
            warn!(
                resource_id = %request.resource_id,
                status = %output.status,
                "Extractor failed: {detail}"
            );
            self.cleanup_partials(&prefix).await;
            bail!("yt-dlp exited with {}: {}", output.status, detail);
        }

        let file_path = self.locate_output(&prefix).await?;
        let metadata = fs::metadata(&file_path)
            .await
            .with_context(|| format!("Failed to stat {}", file_path.display()))?;

        info!(
            resource_id = %request.resource_id,
            file_path = %file_path.display(),
            size_bytes = metadata.len(),
            "Extractor finished"
        );

        Ok(FetchedMedia {
            file_path,
            size_bytes: metadata.len(),
            title: None,
            resolution: None,
        })
    }
}
