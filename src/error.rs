#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Why a source URL could not be turned into a [`crate::media::MediaDescriptor`].
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid or unsupported url: {0}")]
    InvalidOrUnsupportedUrl(String),
    #[error("content unavailable: {0}")]
    ContentUnavailable(String),
    #[error("extraction timed out after {}s", .0.as_secs())]
    UpstreamTimeout(Duration),
    #[error("no direct media url found in extractor output")]
    NoDirectUrlFound,
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOrUnsupportedUrl(_) => "INVALID_OR_UNSUPPORTED_URL",
            Self::ContentUnavailable(_) => "CONTENT_UNAVAILABLE",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Self::NoDirectUrlFound => "NO_DIRECT_URL_FOUND",
            Self::ExtractionFailed(_) => "EXTRACTION_FAILED",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_))
    }

    /// Maps extractor diagnostics (yt-dlp stderr, mirror failures) onto the
    /// taxonomy. Only the last `ERROR` line is inspected, with the
    /// `[extractor] id:` prefix removed so ids and URLs never match a phrase.
    pub fn classify(message: &str) -> Self {
        let detail = last_error_line(message);
        let diagnostic = strip_extractor_prefix(&detail).to_ascii_lowercase();
        let mentions = |phrases: &[&str]| phrases.iter().any(|phrase| diagnostic.contains(phrase));

        if mentions(INVALID_URL_PHRASES) {
            Self::InvalidOrUnsupportedUrl(detail)
        } else if mentions(UNAVAILABLE_PHRASES) {
            Self::ContentUnavailable(detail)
        } else if mentions(TIMEOUT_PHRASES) {
            Self::UpstreamTimeout(Duration::ZERO)
        } else {
            Self::ExtractionFailed(detail)
        }
    }
}

const INVALID_URL_PHRASES: &[&str] = &[
    "unsupported url",
    "is not a valid url",
    "no such host",
    "name or service not known",
];

const UNAVAILABLE_PHRASES: &[&str] = &[
    "private video",
    "video unavailable",
    "video is unavailable",
    "content isn't available",
    "requested content is not available",
    "has been removed",
    "account has been terminated",
    "geo restrict",
    "not available in your country",
    "made this video available in your country",
    "login required",
    "sign in to confirm",
    "members-only",
    "http error 404",
    "http error 410",
];

const TIMEOUT_PHRASES: &[&str] = &["timed out", "timeouterror"];

fn last_error_line(message: &str) -> String {
    let line = message
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| message.lines().map(str::trim).rfind(|line| !line.is_empty()))
        .unwrap_or("unknown extractor error");
    line.trim_start_matches("ERROR:").trim().to_string()
}

/// `[youtube] abc123: Private video` -> `Private video`. A leading token with
/// spaces before the colon is prose, not an id, and is kept.
fn strip_extractor_prefix(detail: &str) -> &str {
    let Some(rest) = detail.strip_prefix('[').and_then(|rest| rest.split_once(']')) else {
        return detail;
    };
    let rest = rest.1.trim_start();
    match rest.split_once(':') {
        Some((id, tail)) if !id.is_empty() && !id.contains(char::is_whitespace) => tail.trim_start(),
        _ => rest,
    }
}

/// Failures while relaying bytes from a direct URL.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("upstream responded with status {0}")]
    UpstreamStatus(u16),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream transfer aborted: {0}")]
    Transfer(#[from] std::io::Error),
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UpstreamStatus(_) => "UPSTREAM_STATUS",
            Self::Request(_) => "UPSTREAM_REQUEST",
            Self::Transfer(_) => "UPSTREAM_TRANSFER",
        }
    }
}
