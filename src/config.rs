use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    // Signs flash-message cookies. A random key is used when unset.
    pub secret_key: Option<String>,

    // Hosts (and their subdomains) accepted on the form.
    pub allowed_domains: Vec<String>,
    pub workspace_root: PathBuf,
    pub workspace_prefix: String,

    pub ytdlp_bin: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_bin: Option<PathBuf>,
    // Explicit yt-dlp proxy (e.g. socks5://127.0.0.1:7890).
    pub ytdlp_proxy: Option<String>,
    // Whether to let yt-dlp inherit http_proxy/https_proxy from the service environment.
    pub inherit_proxy_env: bool,
    // Netscape cookie jar for logged-in quality levels.
    pub cookies_file: Option<PathBuf>,
    pub check_certificates: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfigFile {
    listen_addr: Option<String>,
    secret_key: Option<String>,

    allowed_domains: Option<Vec<String>>,
    workspace_root: Option<String>,
    workspace_prefix: Option<String>,

    ytdlp_bin: Option<String>,
    ytdlp_path: Option<String>,
    ffmpeg_bin: Option<String>,
    ytdlp_proxy: Option<String>,
    inherit_proxy_env: Option<bool>,
    cookies_file: Option<String>,
    check_certificates: Option<bool>,
}

const MIN_SECRET_KEY_LEN: usize = 32;

fn default_ytdlp_path() -> String {
    // Prefer inheriting PATH from the service process; override via config.toml when needed.
    std::env::var("PATH").unwrap_or_else(|_| {
        "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string()
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    /// Load from `path`. A missing file is only an error when `required` is set.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        if !required && !path.exists() {
            let cfg = Self::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        let raw = fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config file: {}",
                path.to_string_lossy().as_ref()
            )
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: AppConfigFile = toml::from_str(raw).context("Failed to parse config.toml")?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        Self {
            listen_addr: file.listen_addr.unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            secret_key: non_empty(file.secret_key),

            allowed_domains: file
                .allowed_domains
                .unwrap_or_else(|| vec!["bilibili.com".to_string()])
                .into_iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            workspace_root: non_empty(file.workspace_root)
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            workspace_prefix: file
                .workspace_prefix
                .unwrap_or_else(|| "bili-download-".to_string()),

            ytdlp_bin: PathBuf::from(file.ytdlp_bin.unwrap_or_else(|| "yt-dlp".to_string())),
            ytdlp_path: file.ytdlp_path.unwrap_or_else(default_ytdlp_path),
            ffmpeg_bin: non_empty(file.ffmpeg_bin).map(PathBuf::from),
            ytdlp_proxy: non_empty(file.ytdlp_proxy),
            inherit_proxy_env: file.inherit_proxy_env.unwrap_or(false),
            cookies_file: non_empty(file.cookies_file).map(PathBuf::from),
            check_certificates: file.check_certificates.unwrap_or(false),
        }
    }

    /// Apply `PORT` / `SECRET_KEY` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = non_empty(lookup("PORT")) {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid PORT: {}", port))?;
            let host = match self.listen_addr.rsplit_once(':') {
                Some((host, _)) => host.to_string(),
                None => self.listen_addr.clone(),
            };
            self.listen_addr = format!("{}:{}", host, port);
        }
        if let Some(secret) = non_empty(lookup("SECRET_KEY")) {
            self.secret_key = Some(secret);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.allowed_domains.is_empty() {
            return Err(anyhow!("allowed_domains must list at least one domain"));
        }
        if self.workspace_prefix.is_empty()
            || self.workspace_prefix.contains(|c| c == '/' || c == '\\')
        {
            return Err(anyhow!(
                "Invalid workspace_prefix: {:?} (must be non-empty, without path separators)",
                self.workspace_prefix
            ));
        }
        if let Some(secret) = &self.secret_key {
            if secret.len() < MIN_SECRET_KEY_LEN {
                return Err(anyhow!(
                    "secret_key is too short ({} bytes, need at least {})",
                    secret.len(),
                    MIN_SECRET_KEY_LEN
                ));
            }
        }
        Ok(())
    }
}
