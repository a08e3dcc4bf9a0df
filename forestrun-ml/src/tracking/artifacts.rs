//! Artifact repositories: where a run's files go.

use crate::error::MlError;
use forestrun_core::persistence::copy_into_dir;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Path of the MLflow artifact proxy on a tracking server.
const ARTIFACTS_API: &str = "api/2.0/mlflow-artifacts/artifacts/";

/// Destination for a run's artifacts, resolved from its artifact URI.
#[derive(Debug, Clone)]
pub enum ArtifactRepository {
    /// A directory on the local filesystem.
    Local { root: PathBuf },
    /// An HTTP endpoint accepting `PUT <base>/<artifact_path>/<file name>`.
    Http { client: reqwest::Client, base: Url },
}

impl ArtifactRepository {
    /// Resolve `artifact_uri`.
    ///
    /// `tracking_server` is needed for `mlflow-artifacts:` URIs, which are
    /// relative to the tracking server's artifact proxy.
    pub fn resolve(
        artifact_uri: &str,
        tracking_server: Option<(&reqwest::Client, &Url)>,
    ) -> Result<Self, MlError> {
        if let Some(path) = artifact_uri.strip_prefix("mlflow-artifacts:") {
            let (client, server) = tracking_server.ok_or_else(|| {
                MlError::tracking(format!(
                    "artifact URI '{artifact_uri}' needs a tracking server to resolve"
                ))
            })?;
            // mlflow-artifacts:/1/abc/artifacts or mlflow-artifacts://host:port/1/abc/artifacts
            let path = match path.strip_prefix("//") {
                Some(with_authority) => with_authority
                    .split_once('/')
                    .map_or("", |(_, rest)| rest),
                None => path.trim_start_matches('/'),
            };
            let base = server
                .join(ARTIFACTS_API)
                .and_then(|u| u.join(&format!("{}/", path.trim_end_matches('/'))))
                .map_err(|e| MlError::tracking(format!("bad artifact URI '{artifact_uri}': {e}")))?;
            return Ok(Self::Http {
                client: client.clone(),
                base,
            });
        }
        if artifact_uri.starts_with("http://") || artifact_uri.starts_with("https://") {
            let base = Url::parse(&format!("{}/", artifact_uri.trim_end_matches('/')))
                .map_err(|e| MlError::tracking(format!("bad artifact URI '{artifact_uri}': {e}")))?;
            let client = tracking_server.map_or_else(reqwest::Client::new, |(c, _)| c.clone());
            return Ok(Self::Http { client, base });
        }
        if let Some(rest) = artifact_uri.strip_prefix("file:") {
            if !rest.starts_with("//") && !rest.is_empty() {
                return Ok(Self::Local {
                    root: PathBuf::from(rest),
                });
            }
            let url = Url::parse(artifact_uri)
                .map_err(|e| MlError::tracking(format!("bad artifact URI '{artifact_uri}': {e}")))?;
            let root = url.to_file_path().map_err(|()| {
                MlError::tracking(format!("artifact URI '{artifact_uri}' is not a local path"))
            })?;
            return Ok(Self::Local { root });
        }
        if let Some((scheme, _)) = artifact_uri.split_once("://") {
            return Err(MlError::tracking(format!(
                "unsupported artifact URI scheme '{scheme}'"
            )));
        }
        Ok(Self::Local {
            root: PathBuf::from(artifact_uri),
        })
    }

    /// Upload `local_path` under `artifact_path` (or at the root). Returns the artifact's location.
    pub async fn log_artifact(
        &self,
        local_path: &Path,
        artifact_path: Option<&str>,
    ) -> Result<String, MlError> {
        if !local_path.is_file() {
            return Err(MlError::not_found(format!(
                "artifact source {}",
                local_path.display()
            )));
        }
        if let Some(sub) = artifact_path {
            super::validate_key("artifact path", sub)?;
        }
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MlError::invalid_input(format!("{} has no file name", local_path.display()))
            })?;

        match self {
            Self::Local { root } => {
                let dest_dir = match artifact_path {
                    Some(sub) => root.join(sub),
                    None => root.clone(),
                };
                let dest = copy_into_dir(local_path, &dest_dir)?;
                debug!(dest = %dest.display(), "Copied artifact");
                Ok(dest.to_string_lossy().into_owned())
            }
            Self::Http { client, base } => {
                let relative = match artifact_path {
                    Some(sub) => format!("{}/{}", sub.trim_end_matches('/'), file_name),
                    None => file_name.to_string(),
                };
                let url = base
                    .join(&relative)
                    .map_err(|e| MlError::tracking(format!("bad artifact path '{relative}': {e}")))?;
                let body = tokio::fs::read(local_path).await?;
                let response = client.put(url.clone()).body(body).send().await?;
                if !response.status().is_success() {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(MlError::tracking(format!(
                        "artifact upload to {url} failed with {status}: {text}"
                    )));
                }
                debug!(%url, "Uploaded artifact");
                Ok(url.to_string())
            }
        }
    }
}
