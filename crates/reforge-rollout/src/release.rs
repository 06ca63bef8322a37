//! Release sources: where new versions come from.
//!
//! - **`github://owner/repo`** — the GitHub releases API (`/releases/latest`).
//!   The asset is the first whose name contains the configured pattern; a
//!   sibling `<asset>.sha256` is used as its checksum when present.
//! - **`file:///dir`** — a directory of `<tag>.zip` files with optional
//!   `<tag>.zip.sha256` next to them. Latest is the highest semver tag.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use reforge_core::config::UpdateConfig;
use reforge_core::{BoxFuture, ReleaseSourceUri, Version};

use crate::error::{ReleaseError, ReleaseResult};
use crate::staging::parse_checksum;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("reforge/", env!("CARGO_PKG_VERSION"));

/// Where a release asset can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    Url(String),
    File(PathBuf),
}

/// The newest release a source offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub asset_name: String,
    pub artifact: AssetLocation,
    pub checksum: Option<AssetLocation>,
}

/// A release artifact copied to local disk.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub archive: PathBuf,
    /// Published SHA-256, if the source has one.
    pub expected_sha256: Option<String>,
}

/// Supplies the latest available version and its artifact.
pub trait ReleaseSource: Send + Sync {
    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    fn latest(&self) -> BoxFuture<'_, ReleaseResult<Release>>;

    /// Copy the release artifact into `dest_dir`.
    fn fetch<'a>(
        &'a self,
        release: &'a Release,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, ReleaseResult<FetchedArtifact>>;
}

/// Build the source named by `update.source`.
pub fn from_config(config: &UpdateConfig) -> ReleaseResult<Box<dyn ReleaseSource>> {
    match ReleaseSourceUri::parse(&config.source)? {
        ReleaseSourceUri::Github { owner, repo } => Ok(Box::new(GithubReleases::new(
            &owner,
            &repo,
            &config.asset_pattern,
            config.download_timeout,
        )?)),
        ReleaseSourceUri::Directory { path } => Ok(Box::new(DirectoryReleases::new(path))),
    }
}

// ── GitHub ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Releases published on GitHub.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    owner: String,
    repo: String,
    asset_pattern: String,
    api_base: String,
    client: reqwest::Client,
}

impl GithubReleases {
    pub fn new(
        owner: &str,
        repo: &str,
        asset_pattern: &str,
        timeout: Duration,
    ) -> ReleaseResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ReleaseError::Http {
                url: GITHUB_API.to_string(),
                source,
            })?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            asset_pattern: asset_pattern.to_string(),
            api_base: GITHUB_API.to_string(),
            client,
        })
    }

    /// Point at a GitHub-compatible API other than api.github.com.
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn latest_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        )
    }

    async fn get(&self, url: &str) -> ReleaseResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|source| ReleaseError::Http {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(ReleaseError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch_latest(&self) -> ReleaseResult<Release> {
        let url = self.latest_url();
        let release: GithubRelease = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|source| ReleaseError::Http {
                url: url.clone(),
                source,
            })?;
        select_asset(release, &self.asset_pattern)
    }

    async fn download(&self, release: &Release, dest_dir: &Path) -> ReleaseResult<FetchedArtifact> {
        let AssetLocation::Url(url) = &release.artifact else {
            return Err(ReleaseError::NoAsset {
                tag: release.version.to_string(),
                pattern: self.asset_pattern.clone(),
            });
        };

        let bytes = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|source| ReleaseError::Http {
                url: url.clone(),
                source,
            })?;
        let archive = dest_dir.join(&release.asset_name);
        tokio::fs::write(&archive, &bytes)
            .await
            .map_err(|source| ReleaseError::Io {
                path: archive.clone(),
                source,
            })?;
        debug!(url = %url, bytes = bytes.len(), "release asset downloaded");

        let expected_sha256 = match &release.checksum {
            Some(AssetLocation::Url(sum_url)) => {
                let text = self
                    .get(sum_url)
                    .await?
                    .text()
                    .await
                    .map_err(|source| ReleaseError::Http {
                        url: sum_url.clone(),
                        source,
                    })?;
                parse_checksum(&text)
            }
            _ => None,
        };

        Ok(FetchedArtifact {
            archive,
            expected_sha256,
        })
    }
}

fn select_asset(release: GithubRelease, pattern: &str) -> ReleaseResult<Release> {
    let asset = release
        .assets
        .iter()
        .find(|a| a.name.contains(pattern) && !a.name.ends_with(".sha256"))
        .ok_or_else(|| ReleaseError::NoAsset {
            tag: release.tag_name.clone(),
            pattern: pattern.to_string(),
        })?;
    let checksum_name = format!("{}.sha256", asset.name);
    let checksum = release
        .assets
        .iter()
        .find(|a| a.name == checksum_name)
        .map(|a| AssetLocation::Url(a.browser_download_url.clone()));

    Ok(Release {
        version: Version::new(release.tag_name.as_str()),
        asset_name: asset.name.clone(),
        artifact: AssetLocation::Url(asset.browser_download_url.clone()),
        checksum,
    })
}

impl ReleaseSource for GithubReleases {
    fn describe(&self) -> String {
        format!("github://{}/{}", self.owner, self.repo)
    }

    fn latest(&self) -> BoxFuture<'_, ReleaseResult<Release>> {
        Box::pin(self.fetch_latest())
    }

    fn fetch<'a>(
        &'a self,
        release: &'a Release,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, ReleaseResult<FetchedArtifact>> {
        Box::pin(self.download(release, dest_dir))
    }
}

// ── Local directory ────────────────────────────────────────────────

/// Releases dropped into a local directory as `<tag>.zip`.
#[derive(Debug, Clone)]
pub struct DirectoryReleases {
    dir: PathBuf,
}

impl DirectoryReleases {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn scan(&self) -> ReleaseResult<Release> {
        let io_err = |source: std::io::Error| ReleaseError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut tags = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == "zip") && path.is_file() {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    tags.push(Version::new(stem));
                }
            }
        }

        let version = newest(tags).ok_or_else(|| ReleaseError::NoRelease(self.describe()))?;
        let asset_name = format!("{version}.zip");
        let artifact = self.dir.join(&asset_name);
        let checksum = self.dir.join(format!("{asset_name}.sha256"));

        Ok(Release {
            version,
            asset_name,
            artifact: AssetLocation::File(artifact),
            checksum: checksum.is_file().then_some(AssetLocation::File(checksum)),
        })
    }

    async fn copy_out(&self, release: &Release, dest_dir: &Path) -> ReleaseResult<FetchedArtifact> {
        let AssetLocation::File(source) = &release.artifact else {
            return Err(ReleaseError::NoRelease(self.describe()));
        };
        let archive = dest_dir.join(&release.asset_name);
        tokio::fs::copy(source, &archive)
            .await
            .map_err(|e| ReleaseError::Io {
                path: source.clone(),
                source: e,
            })?;

        let expected_sha256 = match &release.checksum {
            Some(AssetLocation::File(path)) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ReleaseError::Io {
                        path: path.clone(),
                        source,
                    })?;
                parse_checksum(&text)
            }
            _ => None,
        };

        Ok(FetchedArtifact {
            archive,
            expected_sha256,
        })
    }
}

/// Highest semver tag; when no tag parses, the lexically greatest.
fn newest(tags: Vec<Version>) -> Option<Version> {
    let (semver, other): (Vec<_>, Vec<_>) = tags.into_iter().partition(|t| t.semver().is_some());
    if !semver.is_empty() {
        return semver.into_iter().max_by(|a, b| a.semver().cmp(&b.semver()));
    }
    other
        .into_iter()
        .max_by(|a, b| a.as_str().cmp(b.as_str()))
}

impl ReleaseSource for DirectoryReleases {
    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    fn latest(&self) -> BoxFuture<'_, ReleaseResult<Release>> {
        Box::pin(async move { self.scan() })
    }

    fn fetch<'a>(
        &'a self,
        release: &'a Release,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, ReleaseResult<FetchedArtifact>> {
        Box::pin(self.copy_out(release, dest_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn github_release(json: &str) -> GithubRelease {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn github_asset_and_checksum_selected() {
        let release = github_release(
            r#"{
                "tag_name": "v1.1.0",
                "assets": [
                    {"name": "notes.txt", "browser_download_url": "https://dl/notes.txt"},
                    {"name": "app-v1.1.0.zip.sha256", "browser_download_url": "https://dl/sum"},
                    {"name": "app-v1.1.0.zip", "browser_download_url": "https://dl/app.zip"}
                ]
            }"#,
        );
        let selected = select_asset(release, ".zip").unwrap();

        assert_eq!(selected.version, Version::new("v1.1.0"));
        assert_eq!(selected.asset_name, "app-v1.1.0.zip");
        assert_eq!(selected.artifact, AssetLocation::Url("https://dl/app.zip".into()));
        assert_eq!(selected.checksum, Some(AssetLocation::Url("https://dl/sum".into())));
    }

    #[test]
    fn github_release_without_matching_asset() {
        let release = github_release(r#"{"tag_name": "v2.0.0", "assets": []}"#);
        let err = select_asset(release, ".zip").unwrap_err();
        assert!(matches!(err, ReleaseError::NoAsset { ref tag, .. } if tag == "v2.0.0"));
    }

    #[tokio::test]
    async fn github_latest_url() {
        let source = GithubReleases::new("acme", "app", ".zip", Duration::from_secs(5))
            .unwrap()
            .with_api_base("http://127.0.0.1:9/");
        assert_eq!(
            source.latest_url(),
            "http://127.0.0.1:9/repos/acme/app/releases/latest"
        );
        assert_eq!(source.describe(), "github://acme/app");
    }

    #[test]
    fn newest_prefers_semver_order() {
        let tags = ["v1.9.0", "v1.10.0", "v1.2.3"].map(Version::new).to_vec();
        assert_eq!(newest(tags), Some(Version::new("v1.10.0")));
    }

    #[test]
    fn newest_falls_back_to_lexical() {
        let tags = ["nightly-a", "nightly-c", "nightly-b"].map(Version::new).to_vec();
        assert_eq!(newest(tags), Some(Version::new("nightly-c")));
        assert_eq!(newest(Vec::new()), None);
    }

    #[tokio::test]
    async fn directory_source_picks_latest_and_copies() {
        let releases = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(releases.path().join("v1.0.0.zip"), "old").unwrap();
        fs::write(releases.path().join("v1.1.0.zip"), "new").unwrap();
        fs::write(releases.path().join("README"), "ignored").unwrap();
        let digest = "b".repeat(64);
        fs::write(
            releases.path().join("v1.1.0.zip.sha256"),
            format!("{digest}  v1.1.0.zip\n"),
        )
        .unwrap();

        let source = DirectoryReleases::new(releases.path());
        let release = source.latest().await.unwrap();
        assert_eq!(release.version, Version::new("v1.1.0"));

        let fetched = source.fetch(&release, dest.path()).await.unwrap();
        assert_eq!(fs::read_to_string(&fetched.archive).unwrap(), "new");
        assert_eq!(fetched.expected_sha256, Some(digest));
    }

    #[tokio::test]
    async fn empty_directory_has_no_release() {
        let releases = tempfile::tempdir().unwrap();
        let source = DirectoryReleases::new(releases.path());
        assert!(matches!(source.latest().await, Err(ReleaseError::NoRelease(_))));
    }

    #[tokio::test]
    async fn missing_directory_is_an_io_error() {
        let source = DirectoryReleases::new("/nonexistent/reforge/releases");
        assert!(matches!(source.latest().await, Err(ReleaseError::Io { .. })));
    }

    #[tokio::test]
    async fn config_selects_source_kind() {
        let mut config = UpdateConfig::default();
        config.source = "github://acme/app".into();
        assert!(from_config(&config).unwrap().describe().starts_with("github://"));

        config.source = "file:///srv/releases".into();
        assert_eq!(from_config(&config).unwrap().describe(), "file:///srv/releases");

        config.source = "ftp://nope".into();
        assert!(matches!(from_config(&config), Err(ReleaseError::Source(_))));
    }
}
