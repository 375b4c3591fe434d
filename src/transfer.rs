//! Checkpoint and dataset exchange with the model marketplace
//!
//! Downloads are zip archives whose display name travels in a response
//! header. A non-200 download, or one without the name header, is not an
//! error: the artifact is simply unavailable and the caller carries on
//! without it.

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHECKPOINT_NAME_HEADER: &str = "X-Checkpoint-Name";
pub const DATASET_NAME_HEADER: &str = "X-Dataset-Name";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("marketplace request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("marketplace returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract {archive}: {reason}")]
    Extract { archive: PathBuf, reason: String },

    #[error("invalid dataset manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },
}

impl TransferError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What is being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Checkpoint,
    Dataset,
}

impl ArtifactKind {
    fn api_segment(self) -> &'static str {
        match self {
            ArtifactKind::Checkpoint => "checkpoint_model_marketplace",
            ArtifactKind::Dataset => "dataset_model_marketplace",
        }
    }

    fn name_header(self) -> &'static str {
        match self {
            ArtifactKind::Checkpoint => CHECKPOINT_NAME_HEADER,
            ArtifactKind::Dataset => DATASET_NAME_HEADER,
        }
    }
}

/// Token-authenticated marketplace client
#[derive(Debug, Clone)]
pub struct MarketplaceClient {
    client: reqwest::Client,
    host: String,
    token: String,
}

impl MarketplaceClient {
    pub fn new(host: &str, token: impl Into<String>) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `GET .../download/<id>?project_id=<project>`
    pub fn download_url(&self, kind: ArtifactKind, id: &str, project_id: &str) -> String {
        format!(
            "{}/api/{}/download/{}?project_id={}",
            self.host,
            kind.api_segment(),
            id,
            project_id
        )
    }

    pub fn upload_url(&self) -> String {
        format!("{}/api/checkpoint_model_marketplace/upload/", self.host)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static("application/json"));
        if let Ok(value) = format!("Token {}", self.token).parse() {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// Save a checkpoint archive to `archive`, returning its name
    pub async fn download_checkpoint(
        &self,
        project_id: &str,
        checkpoint_id: &str,
        archive: &Path,
    ) -> Result<Option<String>, TransferError> {
        self.download(ArtifactKind::Checkpoint, project_id, checkpoint_id, archive)
            .await
    }

    /// Save a dataset archive to `archive`, returning its name
    pub async fn download_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
        archive: &Path,
    ) -> Result<Option<String>, TransferError> {
        self.download(ArtifactKind::Dataset, project_id, dataset_id, archive)
            .await
    }

    async fn download(
        &self,
        kind: ArtifactKind,
        project_id: &str,
        id: &str,
        archive: &Path,
    ) -> Result<Option<String>, TransferError> {
        let url = self.download_url(kind, id, project_id);
        let response = self.client.get(&url).headers(self.headers()).send().await?;

        if response.status() != StatusCode::OK {
            warn!(url = %url, status = response.status().as_u16(), "Artifact unavailable");
            return Ok(None);
        }

        let name = header_value(response.headers(), kind.name_header());
        let body = response.bytes().await?;

        if let Some(parent) = archive.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        tokio::fs::write(archive, &body)
            .await
            .map_err(|e| TransferError::io(archive, e))?;

        info!(
            kind = ?kind,
            id = id,
            name = ?name,
            bytes = body.len(),
            "Artifact downloaded"
        );
        if name.is_none() {
            warn!(id = id, header = kind.name_header(), "Archive saved without a name");
        }
        Ok(name)
    }

    /// Upload a trained checkpoint, returning the name the marketplace gave it
    pub async fn upload_checkpoint(
        &self,
        project_id: &str,
        checkpoint: &Path,
    ) -> Result<Option<String>, TransferError> {
        let bytes = tokio::fs::read(checkpoint)
            .await
            .map_err(|e| TransferError::io(checkpoint, e))?;
        let file_name = checkpoint
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "last.pt".to_string());

        let form = Form::new()
            .text("type_checkpoint", "ml_checkpoint")
            .text("project_id", project_id.to_string())
            .text("is_training", "True")
            .part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .post(self.upload_url())
            .headers(self.headers())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let name = header_value(response.headers(), CHECKPOINT_NAME_HEADER);
        info!(project_id = project_id, name = ?name, "Checkpoint uploaded");
        Ok(name)
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|v| !v.is_empty())
}

/// Unpack `archive` into `dest` with the system `unzip` tool
///
/// Files land in a staging directory next to `dest` that is renamed into
/// place only once `unzip` succeeds, so a failed extraction never leaves a
/// partial `dest` behind for the next run to mistake for a cached artifact.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), TransferError> {
    let staging = staging_dir(dest);
    if let Err(e) = unzip_into(archive, &staging).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        // Another run finished the same artifact first
        if tokio::fs::metadata(dest).await.is_ok() {
            debug!(dest = %dest.display(), "Archive already extracted");
            return Ok(());
        }
        return Err(TransferError::io(dest, e));
    }

    debug!(archive = %archive.display(), dest = %dest.display(), "Archive extracted");
    Ok(())
}

fn staging_dir(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial-{}", name, Uuid::new_v4().simple()))
}

async fn unzip_into(archive: &Path, dir: &Path) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TransferError::io(dir, e))?;

    let output = Command::new("unzip")
        .arg("-o")
        .arg("-q")
        .arg(archive)
        .arg("-d")
        .arg(dir)
        .output()
        .await
        .map_err(|e| TransferError::Extract {
            archive: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(TransferError::Extract {
            archive: archive.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Point a dataset's split entries at the layout the trainer expects
pub fn rewrite_dataset_yaml(path: &Path) -> Result<(), TransferError> {
    let text = std::fs::read_to_string(path).map_err(|e| TransferError::io(path, e))?;
    let manifest = |reason: String| TransferError::Manifest {
        path: path.to_path_buf(),
        reason,
    };

    let mut doc: Value = serde_yaml::from_str(&text).map_err(|e| manifest(e.to_string()))?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| manifest("top level is not a mapping".to_string()))?;

    for (key, value) in [
        ("train", "train/images"),
        ("val", "valid/images"),
        ("test", "test/images"),
    ] {
        map.insert(Value::from(key), Value::from(value));
    }

    let rendered = serde_yaml::to_string(&doc).map_err(|e| manifest(e.to_string()))?;
    std::fs::write(path, rendered).map_err(|e| TransferError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = MarketplaceClient::new("https://market.example/", "tok").unwrap();
        assert_eq!(client.host(), "https://market.example");
        assert_eq!(
            client.download_url(ArtifactKind::Checkpoint, "12", "7"),
            "https://market.example/api/checkpoint_model_marketplace/download/12?project_id=7"
        );
        assert_eq!(
            client.download_url(ArtifactKind::Dataset, "3", "7"),
            "https://market.example/api/dataset_model_marketplace/download/3?project_id=7"
        );
        assert_eq!(
            client.upload_url(),
            "https://market.example/api/checkpoint_model_marketplace/upload/"
        );
    }

    #[test]
    fn test_auth_headers() {
        let client = MarketplaceClient::new("http://h", "abc123").unwrap();
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Token abc123");
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_rewrite_dataset_yaml_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.yaml");
        std::fs::write(
            &path,
            "train: ../train/images\nval: ../valid/images\nnc: 2\nnames: [cat, dog]\n",
        )
        .unwrap();

        rewrite_dataset_yaml(&path).unwrap();

        let doc: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["train"], Value::from("train/images"));
        assert_eq!(doc["val"], Value::from("valid/images"));
        assert_eq!(doc["test"], Value::from("test/images"));
        assert_eq!(doc["nc"].as_u64(), Some(2));
        assert_eq!(doc["names"][1], Value::from("dog"));
    }

    #[test]
    fn test_rewrite_dataset_yaml_rejects_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.yaml");
        std::fs::write(&path, "- a\n- b\n").unwrap();

        assert!(matches!(
            rewrite_dataset_yaml(&path),
            Err(TransferError::Manifest { .. })
        ));
    }

    #[test]
    fn test_rewrite_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            rewrite_dataset_yaml(&dir.path().join("absent.yaml")),
            Err(TransferError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_extract_invalid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();

        let result = extract_archive(&archive, &dir.path().join("out")).await;
        assert!(matches!(result, Err(TransferError::Extract { .. })));
    }

    #[tokio::test]
    async fn test_failed_extract_leaves_nothing_behind() {
        let source = tempfile::tempdir().unwrap();
        let archive = source.path().join("data.zip");
        std::fs::write(&archive, b"PK truncated").unwrap();

        let models = tempfile::tempdir().unwrap();
        let dest = models.path().join("v1");
        assert!(extract_archive(&archive, &dest).await.is_err());

        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(models.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_staging_dir_is_a_hidden_sibling() {
        let dest = Path::new("/work/models/v1");
        let first = staging_dir(dest);
        let second = staging_dir(dest);

        assert_eq!(first.parent(), dest.parent());
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".v1.partial-"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_download_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let client = MarketplaceClient::new("http://127.0.0.1:1", "tok").unwrap();
        let result = client
            .download_checkpoint("7", "12", &dir.path().join("w.zip"))
            .await;
        assert!(matches!(result, Err(TransferError::Request(_))));
    }
}
