use futures::StreamExt;
use nix::unistd::{chown, geteuid, Gid, Uid};
use reqwest::Client;
use serde::Deserialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::errors::UpdateError;
use crate::{AgentError, AgentResult};

#[derive(Debug, Deserialize)]
struct VersionResponse {
    result: String,
}

#[derive(Debug, Deserialize)]
struct LinksResponse {
    result: LinksResult,
}

#[derive(Debug, Deserialize)]
struct LinksResult {
    #[serde(default)]
    links: Vec<DownloadLink>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub download_type: String,
    pub download_url: String,
}

/// Keeps the server binary in the install directory in step with the
/// release feed. The version marker is only written after the binary is
/// fully in place.
pub struct UpdateManager {
    client: Client,
    config: UpdateConfig,
}

impl UpdateManager {
    pub fn new(config: UpdateConfig) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn binary_path(&self) -> PathBuf {
        self.config.install_dir.join(&self.config.binary_name)
    }

    fn marker_path(&self) -> PathBuf {
        self.config.install_dir.join(&self.config.version_file)
    }

    fn staging_path(&self) -> PathBuf {
        self.config
            .install_dir
            .join(format!(".{}.download", self.config.binary_name))
    }

    /// Version recorded by the last successful update, if any.
    pub async fn installed_version(&self) -> Option<String> {
        let content = fs::read_to_string(self.marker_path()).await.ok()?;
        let version = content.trim();
        if version.is_empty() {
            None
        } else {
            Some(version.to_string())
        }
    }

    pub async fn latest_version(&self) -> Result<String, UpdateError> {
        let resp: VersionResponse = self.fetch_json(&self.config.version_url).await?;
        let version = resp.result.trim().to_string();
        if version.is_empty() {
            return Err(UpdateError::FeedUnavailable(
                "feed returned an empty version".to_string(),
            ));
        }
        Ok(version)
    }

    pub async fn resolve_download_url(&self) -> Result<String, UpdateError> {
        let resp: LinksResponse = self.fetch_json(&self.config.links_url).await?;
        resp.result
            .links
            .into_iter()
            .find(|link| link.download_type == self.config.artifact_type)
            .map(|link| link.download_url)
            .ok_or_else(|| UpdateError::NoMatchingArtifact(self.config.artifact_type.clone()))
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::FeedUnavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(UpdateError::FeedUnavailable(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| UpdateError::FeedUnavailable(format!("{}: {}", url, e)))
    }

    /// A missing marker always needs an install. A feed failure never
    /// reports an update.
    pub async fn check_update_available(&self) -> bool {
        let Some(installed) = self.installed_version().await else {
            info!("No installed version recorded, update required");
            return true;
        };

        match self.latest_version().await {
            Ok(latest) => {
                debug!("Installed version {}, latest {}", installed, latest);
                latest != installed
            }
            Err(e) => {
                warn!("Update check failed: {}", e);
                false
            }
        }
    }

    /// Install the latest release. Returns false with the cause logged on
    /// any failure; the previous install is left untouched in that case.
    pub async fn update(&self) -> bool {
        match self.try_update().await {
            Ok(version) => {
                info!("Server updated to version {}", version);
                true
            }
            Err(e) => {
                error!("Update failed: {}", e);
                false
            }
        }
    }

    pub async fn try_update(&self) -> Result<String, UpdateError> {
        let version = self.latest_version().await?;
        let url = self.resolve_download_url().await?;
        info!("Downloading version {} from {}", version, url);

        fs::create_dir_all(&self.config.install_dir).await?;

        let staging = self.staging_path();
        if let Err(e) = self.download(&url, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        let binary = self.binary_path();
        fs::rename(&staging, &binary).await?;

        let marker = self.marker_path();
        let marker_staging = marker.with_extension("tmp");
        fs::write(&marker_staging, format!("{}\n", version)).await?;
        fs::rename(&marker_staging, &marker).await?;

        if let Err(e) = self.fix_ownership(&[binary.as_path(), marker.as_path()]) {
            warn!("Failed to reset ownership of installed files: {}", e);
        }

        Ok(version)
    }

    async fn download(&self, url: &str, target: &Path) -> Result<u64, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed(format!(
                "download returned HTTP {}",
                response.status()
            )));
        }
        let expected = response.content_length();

        let mut file = fs::File::create(target).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(UpdateError::DownloadFailed("empty download".to_string()));
        }
        if let Some(expected) = expected {
            if expected != written {
                return Err(UpdateError::DownloadFailed(format!(
                    "truncated download: {} of {} bytes",
                    written, expected
                )));
            }
        }

        debug!("Downloaded {} bytes to {}", written, target.display());
        Ok(written)
    }

    /// When running as root, hand installed files back to the owner of the
    /// install directory.
    fn fix_ownership(&self, paths: &[&Path]) -> Result<(), UpdateError> {
        if !geteuid().is_root() {
            return Ok(());
        }
        let meta = std::fs::metadata(&self.config.install_dir)?;
        let uid = Uid::from_raw(meta.uid());
        let gid = Gid::from_raw(meta.gid());
        for path in paths {
            chown(*path, Some(uid), Some(gid)).map_err(std::io::Error::from)?;
        }
        Ok(())
    }
}
