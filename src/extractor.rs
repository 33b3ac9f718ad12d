#![forbid(unsafe_code)]

//! The extraction capability: something that looks at a page URL and returns
//! yt-dlp shaped metadata without downloading the media itself.
//!
//! [`YtDlpExtractor`] shells out to `yt-dlp --dump-single-json`. Other
//! strategies (the HTML mirror scraper, test doubles) produce the same
//! [`ExtractedInfo`] so the resolver only has to understand one shape.

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::error::ResolveError;
use crate::media::SizeHint;

/// Subset of yt-dlp's info dict the resolver reads. Everything is optional
/// because extractors fill in wildly different fields per platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedInfo {
    pub url: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
    #[serde(default)]
    pub requested_formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub format_note: Option<String>,
}

impl FormatInfo {
    /// `None` means the extractor did not say, which counts as "maybe".
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    pub fn usable_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn size_hint(&self) -> SizeHint {
        SizeHint::new(self.filesize, self.filesize_approx)
    }

    /// Storyboards and thumbnails report neither codec.
    pub fn is_media(&self) -> bool {
        let storyboard = self
            .format_note
            .as_deref()
            .is_some_and(|note| note.eq_ignore_ascii_case("storyboard"));
        !storyboard && (self.has_video() || self.has_audio())
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Metadata-only extraction using the given yt-dlp format expression.
    async fn extract(&self, source_url: &Url, format: &str) -> Result<ExtractedInfo, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: PathBuf,
    cookies: Option<PathBuf>,
    user_agent: String,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            cookies: None,
            user_agent: user_agent.into(),
            timeout,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    fn command(&self, source_url: &Url, format: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("--geo-bypass")
            .arg("--user-agent")
            .arg(&self.user_agent)
            .arg("--format")
            .arg(format);

        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }

        command
            .arg("--")
            .arg(source_url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract(&self, source_url: &Url, format: &str) -> Result<ExtractedInfo, ResolveError> {
        let started = Instant::now();
        let child = self.command(source_url, format).spawn().map_err(|err| {
            ResolveError::ExtractionFailed(format!(
                "launching {}: {err}",
                self.program.display()
            ))
        })?;

        // Dropping the future on timeout drops the child, and kill_on_drop
        // reaps the process.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(url = %source_url, timeout = ?self.timeout, "yt-dlp timed out");
                ResolveError::UpstreamTimeout(self.timeout)
            })?
            .map_err(|err| ResolveError::ExtractionFailed(format!("waiting for yt-dlp: {err}")))?;

        debug!(
            url = %source_url,
            status = %output.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "yt-dlp finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(match ResolveError::classify(&stderr) {
                ResolveError::UpstreamTimeout(_) => ResolveError::UpstreamTimeout(self.timeout),
                other => other,
            });
        }

        parse_info(&output.stdout)
    }
}

pub fn parse_info(raw: &[u8]) -> Result<ExtractedInfo, ResolveError> {
    serde_json::from_slice(raw)
        .map_err(|err| ResolveError::ExtractionFailed(format!("parsing yt-dlp json: {err}")))
}
