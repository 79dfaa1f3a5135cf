//! Request pipeline: validate, acquire a workspace, extract, verify, name, stream.
//!
//! On success the workspace moves into the response body stream and is released when
//! that stream finishes or is dropped by the transport. Every failure path releases it
//! before the failure is reported.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::extract::{extract, ExtractionEngine, ExtractionResult, MediaFormat, YtDlp};
use crate::util::build_download_name;
use crate::workspace::{Workspace, WorkspaceManager};

const CHUNK_SIZE: usize = 64 * 1024;

pub type ArtifactStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone)]
pub struct RequestParameters {
    pub url: String,
    pub media_format: MediaFormat,
    pub custom_name: Option<String>,
}

/// A ready-to-send attachment. Dropping `body` releases the workspace behind it.
pub struct Delivery {
    pub filename: String,
    pub content_type: &'static str,
    pub len: u64,
    pub body: ArtifactStream,
}

pub enum Outcome {
    Success(Delivery),
    Failure(String),
}

pub struct DeliveryPipeline {
    workspaces: WorkspaceManager,
    engine: Arc<dyn ExtractionEngine>,
    allowed_domains: Vec<String>,
}

impl DeliveryPipeline {
    pub fn new(
        workspaces: WorkspaceManager,
        engine: Arc<dyn ExtractionEngine>,
        allowed_domains: Vec<String>,
    ) -> Self {
        Self {
            workspaces,
            engine,
            allowed_domains,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            WorkspaceManager::new(&cfg.workspace_root, &cfg.workspace_prefix),
            Arc::new(YtDlp::from_config(cfg)),
            cfg.allowed_domains.clone(),
        )
    }

    pub async fn handle_request(&self, params: RequestParameters) -> Outcome {
        match self.run(params).await {
            Ok(delivery) => Outcome::Success(delivery),
            Err(e) => {
                if e.is_integrity_anomaly() {
                    log::error!("[DELIVERY] Engine contract violated: {}", e);
                } else if e.is_validation() {
                    log::info!("[DELIVERY] Rejected request: {}", e);
                } else {
                    log::warn!("[DELIVERY] Request failed: {}", e);
                }
                Outcome::Failure(e.user_message())
            }
        }
    }

    async fn run(&self, params: RequestParameters) -> Result<Delivery> {
        let url = validate_url(&params.url, &self.allowed_domains)?;
        let mut workspace = self.workspaces.acquire()?;

        let prepared = self
            .prepare(&workspace, url.as_str(), params.media_format, params.custom_name.as_deref())
            .await;
        match prepared {
            Ok((path, filename, len)) => {
                log::info!("[DELIVERY] Streaming {} ({} bytes) as {:?}", path.display(), len, filename);
                Ok(Delivery {
                    filename,
                    content_type: params.media_format.content_type(),
                    len,
                    body: artifact_stream(path, workspace),
                })
            }
            Err(e) => {
                if let Err(re) = workspace.release() {
                    log::warn!("[WORKSPACE] Failed to remove {}: {}", workspace.path().display(), re);
                }
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        workspace: &Workspace,
        url: &str,
        format: MediaFormat,
        custom_name: Option<&str>,
    ) -> Result<(PathBuf, String, u64)> {
        let result = extract(self.engine.as_ref(), workspace, url, format).await?;
        let (path, len) = verify_artifact(&result, format).await?;
        let filename = format!(
            "{}.{}",
            build_download_name(custom_name, &result.source_title),
            format.extension()
        );
        Ok((path, filename, len))
    }
}

/// Accept only http(s) URLs whose host is one of `allowed_domains` or a subdomain of one.
/// A bare `bilibili.com/...` without a scheme (with or without a port) is read as https.
pub fn validate_url(raw: &str, allowed_domains: &[String]) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::MissingUrl);
    }

    // `host.tld:port/...` would otherwise parse with the host as its scheme.
    let bare_host = !raw.contains("://")
        && raw.split(':').next().map_or(false, |head| head.contains('.'));
    let parsed = if bare_host {
        Url::parse(&format!("https://{}", raw))
    } else {
        match Url::parse(raw) {
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{}", raw)),
            other => other,
        }
    };
    let url = parsed.map_err(|source| Error::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    let unsupported = || Error::UnsupportedSource {
        url: raw.to_string(),
        supported: allowed_domains.join(", "),
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(unsupported());
    }
    let host = url.host_str().ok_or_else(unsupported)?.to_ascii_lowercase();
    let allowed = allowed_domains.iter().any(|d| {
        host == *d
            || host
                .strip_suffix(d.as_str())
                .map_or(false, |rest| rest.ends_with('.'))
    });
    if !allowed {
        return Err(unsupported());
    }
    Ok(url)
}

// The format's extension is forced onto whatever path the engine reported.
async fn verify_artifact(result: &ExtractionResult, format: MediaFormat) -> Result<(PathBuf, u64)> {
    let expected = result.local_path.with_extension(format.extension());
    if !result.declared_extension.eq_ignore_ascii_case(format.extension()) {
        log::warn!(
            "[DELIVERY] Engine produced {} but .{} was requested",
            result.local_path.display(),
            format.extension()
        );
    }

    let meta = match tokio::fs::metadata(&expected).await {
        Ok(m) if m.is_file() => m,
        _ => return Err(Error::ArtifactMissing(expected)),
    };
    if meta.len() == 0 {
        return Err(Error::EmptyArtifact(expected));
    }
    Ok((expected, meta.len()))
}

fn artifact_stream(path: PathBuf, workspace: Workspace) -> ArtifactStream {
    Box::pin(stream! {
        // Owned by the stream: released below on completion, or on drop if the
        // transport abandons the body early.
        let mut workspace = workspace;

        match File::open(&path).await {
            Ok(mut file) => {
                let mut buffer = vec![0u8; CHUNK_SIZE];
                loop {
                    match file.read(&mut buffer).await {
                        Ok(0) => break,
                        Ok(n) => yield Ok(Bytes::copy_from_slice(&buffer[..n])),
                        Err(e) => {
                            yield Err(stream_failed(e));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                yield Err(stream_failed(e));
            }
        }

        if let Err(e) = workspace.release() {
            log::warn!("[WORKSPACE] Failed to remove {}: {}", workspace.path().display(), e);
        }
    })
}

fn stream_failed(e: io::Error) -> io::Error {
    let kind = e.kind();
    log::warn!("[STREAM] {}", Error::Stream(e));
    io::Error::new(kind, "artifact stream failed")
}
