#![forbid(unsafe_code)]

//! Request/descriptor types shared by the resolver, the streamer and the HTTP
//! layer, plus the filename helpers that turn a raw title into something safe
//! to put inside a `Content-Disposition` header.

use serde::Serialize;
use url::Url;

pub const DEFAULT_TITLE: &str = "video";
pub const MAX_TITLE_CHARS: usize = 100;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "mov"];
const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "opus", "ogg", "aac", "flac", "wav"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    AudioOnly,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" | "audio_only" | "audioonly" => Some(Self::AudioOnly),
            _ => None,
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::AudioOnly => "m4a",
        }
    }

    /// yt-dlp format expression for this kind. Every expression ends in a
    /// plain `best` so extraction never fails only because the preferred
    /// stream is missing.
    pub fn format_expression(self) -> &'static str {
        match self {
            Self::Video => {
                "best[ext=mp4][vcodec!=none][acodec!=none]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best"
            }
            Self::AudioOnly => "bestaudio[ext=m4a]/bestaudio/best",
        }
    }
}

/// A single resolution request. Lives for one HTTP request only.
#[derive(Clone, Debug)]
pub struct MediaRequest {
    pub source_url: Url,
    pub kind: MediaKind,
    pub quality: Option<String>,
}

impl MediaRequest {
    pub fn new(source_url: Url, kind: MediaKind) -> Self {
        Self {
            source_url,
            kind,
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: Option<String>) -> Self {
        self.quality = quality
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    /// Caller override when present, always terminated by a `best` fallback.
    pub fn format_expression(&self) -> String {
        match &self.quality {
            Some(custom) => {
                let already_terminated = custom
                    .rsplit('/')
                    .next()
                    .is_some_and(|last| last.trim() == "best");
                if already_terminated {
                    custom.clone()
                } else {
                    format!("{custom}/best")
                }
            }
            None => self.kind.format_expression().to_string(),
        }
    }
}

/// Sizes reported by the extractor. Only `exact` may be used to frame a
/// response; `approx` is yt-dlp's bitrate-times-duration estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SizeHint {
    pub exact: Option<u64>,
    pub approx: Option<u64>,
}

impl SizeHint {
    pub fn new(exact: Option<u64>, approx: Option<u64>) -> Self {
        Self { exact, approx }
    }

    pub fn exact(size: u64) -> Self {
        Self::new(Some(size), None)
    }

    /// Best available figure for display purposes.
    pub fn estimate(&self) -> Option<u64> {
        self.exact.or(self.approx)
    }
}

/// Outcome of a successful resolution. `direct_url` is never empty; the
/// constructor is the only way to build one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MediaDescriptor {
    direct_url: String,
    title: String,
    extension: String,
    size: SizeHint,
}

impl MediaDescriptor {
    pub fn new(
        direct_url: impl Into<String>,
        raw_title: Option<&str>,
        raw_extension: Option<&str>,
        kind: MediaKind,
        size: SizeHint,
    ) -> Option<Self> {
        let direct_url = direct_url.into().trim().to_string();
        if direct_url.is_empty() {
            return None;
        }
        Some(Self {
            direct_url,
            title: sanitize_title(raw_title),
            extension: derive_extension(raw_extension, kind).to_string(),
            size,
        })
    }

    pub fn direct_url(&self) -> &str {
        &self.direct_url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Exact byte count, safe to send as `Content-Length`.
    pub fn filesize(&self) -> Option<u64> {
        self.size.exact
    }

    pub fn size(&self) -> SizeHint {
        self.size
    }

    pub fn filename(&self) -> String {
        format!("{}.{}", self.title, self.extension)
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename())
    }

    pub fn content_type(&self) -> String {
        mime_guess::from_ext(&self.extension)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }
}

/// How `/download/*` hands the resolved media to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Proxy,
    Redirect,
    Page,
}

impl DeliveryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proxy" | "stream" => Some(Self::Proxy),
            "redirect" | "302" => Some(Self::Redirect),
            "page" | "html" => Some(Self::Page),
            _ => None,
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9_.-]` with `_` and caps the
/// result at [`MAX_TITLE_CHARS`]. Missing or empty titles become
/// [`DEFAULT_TITLE`]. The output is a fixed point of this function.
pub fn sanitize_title(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        cleaned
    }
}

/// Picks the extension for a descriptor. Audio requests never end up with a
/// video container: anything outside the audio set becomes `m4a`.
pub fn derive_extension(raw: Option<&str>, kind: MediaKind) -> &'static str {
    let normalized = raw
        .map(|value| value.trim().trim_start_matches('.').to_ascii_lowercase())
        .unwrap_or_default();
    let allowed = match kind {
        MediaKind::Video => VIDEO_EXTENSIONS,
        MediaKind::AudioOnly => AUDIO_EXTENSIONS,
    };
    allowed
        .iter()
        .copied()
        .find(|candidate| *candidate == normalized)
        .unwrap_or_else(|| kind.default_extension())
}
