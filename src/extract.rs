//! Extraction adapter: turns a validated URL plus a media format into a file inside
//! the request's workspace, by way of an [`ExtractionEngine`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::workspace::Workspace;

const STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    /// Form values other than `audio` mean video.
    pub fn from_form_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("audio") {
            MediaFormat::Audio
        } else {
            MediaFormat::Video
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaFormat::Video => "mp4",
            MediaFormat::Audio => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MediaFormat::Video => "video/mp4",
            MediaFormat::Audio => "audio/mpeg",
        }
    }

    fn format_selector(self) -> &'static str {
        match self {
            MediaFormat::Video => "bestvideo+bestaudio/best",
            MediaFormat::Audio => "bestaudio/best",
        }
    }

    fn post_process(self) -> PostProcess {
        match self {
            MediaFormat::Video => PostProcess::Merge { container: "mp4" },
            MediaFormat::Audio => PostProcess::ExtractAudio {
                codec: "mp3",
                quality: "192K",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    ExtractAudio {
        codec: &'static str,
        quality: &'static str,
    },
    Merge {
        container: &'static str,
    },
}

/// Declarative job handed to the engine.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub url: String,
    pub format_selector: &'static str,
    pub output_template: PathBuf,
    pub post_process: PostProcess,
}

impl ExtractionJob {
    pub fn new(url: &str, format: MediaFormat, output_template: PathBuf) -> Self {
        Self {
            url: url.to_string(),
            format_selector: format.format_selector(),
            output_template,
            post_process: format.post_process(),
        }
    }
}

/// Metadata the engine reports after a successful run.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EngineReport {
    pub title: Option<String>,
    pub filepath: Option<PathBuf>,
}

#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Download and post-process `job`, writing one artifact through its output template.
    async fn run(&self, job: &ExtractionJob) -> Result<EngineReport>;
}

#[derive(Debug)]
pub struct ExtractionResult {
    pub source_title: String,
    pub local_path: PathBuf,
    pub declared_extension: String,
}

/// Run the engine for `url` and locate what it produced inside `workspace`.
pub async fn extract(
    engine: &dyn ExtractionEngine,
    workspace: &Workspace,
    url: &str,
    format: MediaFormat,
) -> Result<ExtractionResult> {
    let job = ExtractionJob::new(url, format, workspace.output_template());
    let report = engine.run(&job).await?;

    let reported = match report.filepath {
        Some(p) if p.starts_with(workspace.path()) => match tokio::fs::metadata(&p).await {
            Ok(m) if m.is_file() => Some(p),
            _ => None,
        },
        _ => None,
    };
    let local_path = match reported {
        Some(p) => p,
        None => locate_artifact(workspace.path(), format)
            .await
            .ok_or_else(|| Error::ArtifactMissing(workspace.path().to_path_buf()))?,
    };

    let declared_extension = local_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();

    Ok(ExtractionResult {
        source_title: report.title.unwrap_or_default(),
        local_path,
        declared_extension,
    })
}

// Prefer a file with the format's extension, else any regular file.
async fn locate_artifact(dir: &Path, format: MediaFormat) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut fallback = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let p = entry.path();
        let ext = p
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext == format.extension() {
            return Some(p);
        }
        fallback.get_or_insert(p);
    }
    fallback
}

/// Runs the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
    path_env: String,
    ffmpeg: Option<String>,
    proxy: Option<String>,
    inherit_proxy_env: bool,
    cookies_file: Option<PathBuf>,
    check_certificates: bool,
}

impl YtDlp {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            bin: cfg.ytdlp_bin.clone(),
            path_env: cfg.ytdlp_path.clone(),
            ffmpeg: find_ffmpeg(cfg),
            proxy: cfg.ytdlp_proxy.clone(),
            inherit_proxy_env: cfg.inherit_proxy_env,
            cookies_file: cfg.cookies_file.clone(),
            check_certificates: cfg.check_certificates,
        }
    }

    fn command(&self, job: &ExtractionJob) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.env("PATH", &self.path_env);

        if !self.inherit_proxy_env {
            // Avoid being accidentally bound to a dead local proxy (common in shell env).
            cmd.env_remove("http_proxy")
                .env_remove("https_proxy")
                .env_remove("HTTP_PROXY")
                .env_remove("HTTPS_PROXY")
                .env_remove("no_proxy")
                .env_remove("NO_PROXY");
        }

        if let Some(p) = &self.proxy {
            cmd.arg("--proxy").arg(p);
        }
        if let Some(c) = &self.cookies_file {
            cmd.arg("--cookies").arg(c);
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }
        if !self.check_certificates {
            cmd.arg("--no-check-certificates");
        }

        cmd.arg("--no-playlist")
            .arg("--no-cache-dir")
            .arg("--no-part")
            .arg("--no-warnings")
            .arg("-o")
            .arg(&job.output_template)
            .arg("-f")
            .arg(job.format_selector);

        match &job.post_process {
            PostProcess::ExtractAudio { codec, quality } => {
                cmd.arg("-x")
                    .arg("--audio-format")
                    .arg(codec)
                    .arg("--audio-quality")
                    .arg(quality);
            }
            PostProcess::Merge { container } => {
                cmd.arg("--merge-output-format").arg(container);
            }
        }

        // One JSON line on stdout once the final file is in place.
        cmd.arg("--print")
            .arg("after_move:%(.{title,filepath})j")
            .arg("--")
            .arg(&job.url)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        cmd
    }
}

#[async_trait]
impl ExtractionEngine for YtDlp {
    async fn run(&self, job: &ExtractionJob) -> Result<EngineReport> {
        let mut child = self
            .command(job)
            .spawn()
            .map_err(|e| Error::Extraction(format!("failed to start yt-dlp: {}", e)))?;
        if let Some(pid) = child.id() {
            log::info!("[EXTRACT] yt-dlp started (pid={}) url={}", pid, job.url);
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(o), Some(e)) => (o, e),
            _ => return Err(Error::Extraction("failed to capture yt-dlp output".to_string())),
        };

        let tail_buf: Arc<AsyncMutex<VecDeque<String>>> = Arc::new(AsyncMutex::new(VecDeque::new()));
        let stderr_task = tokio::spawn(collect_stderr(stderr, tail_buf.clone()));
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            BufReader::new(stdout).read_to_string(&mut out).await.map(|_| out)
        });

        // No timeout here: a client that gives up drops this future, and kill_on_drop
        // takes the subprocess down with it.
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Extraction(format!("failed waiting for yt-dlp: {}", e)))?;
        let _ = stderr_task.await;
        let stdout = match stdout_task.await {
            Ok(Ok(s)) => s,
            _ => String::new(),
        };

        let tail = render_tail(&tail_buf).await;
        if !status.success() {
            log::warn!("[EXTRACT] yt-dlp exited with {}:\n{}", status, tail.join("\n"));
            return Err(Error::Extraction(failure_cause(&tail, &status.to_string())));
        }

        Ok(parse_report(&stdout))
    }
}

async fn collect_stderr(stderr: tokio::process::ChildStderr, buf: Arc<AsyncMutex<VecDeque<String>>>) {
    let mut r = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match r.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let l = line.trim_end().to_string();
                if !l.is_empty() {
                    log::debug!("[yt-dlp] {}", l);
                    let mut g = buf.lock().await;
                    if g.len() >= STDERR_TAIL_LINES {
                        g.pop_front();
                    }
                    g.push_back(l);
                }
            }
            Err(_) => break,
        }
    }
}

async fn render_tail(buf: &AsyncMutex<VecDeque<String>>) -> Vec<String> {
    buf.lock().await.iter().cloned().collect()
}

// The last `ERROR:` line is what a user can act on; fall back to the last line.
fn failure_cause(tail: &[String], status: &str) -> String {
    tail.iter()
        .rev()
        .find_map(|l| l.find("ERROR:").map(|i| l[i + "ERROR:".len()..].trim().to_string()))
        .or_else(|| tail.last().cloned())
        .unwrap_or_else(|| format!("yt-dlp exited with error (status={})", status))
}

fn parse_report(stdout: &str) -> EngineReport {
    let Some(line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return EngineReport::default();
    };
    match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            log::warn!("[EXTRACT] Unparseable yt-dlp report {:?}: {}", line, e);
            EngineReport::default()
        }
    }
}

fn find_ffmpeg(cfg: &AppConfig) -> Option<String> {
    if let Some(p) = &cfg.ffmpeg_bin {
        return Some(p.to_string_lossy().to_string());
    }
    for p in ["/opt/homebrew/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/usr/bin/ffmpeg"] {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
    }
    None
}
