#![forbid(unsafe_code)]

//! Turns a [`MediaRequest`] into a [`MediaDescriptor`].
//!
//! The resolver owns strategy order (mirror scraping vs. yt-dlp), bounded
//! retries and direct-URL selection. Extraction itself is delegated to the
//! [`Extractor`] implementations.

use std::{cmp::Ordering, sync::Arc};

use tracing::{debug, info, warn};
use url::Url;

use crate::error::ResolveError;
use crate::extractor::{ExtractedInfo, Extractor, FormatInfo};
use crate::media::{MediaDescriptor, MediaKind, MediaRequest, SizeHint};
use crate::mirror::{MirrorPolicy, is_mirrorable};

pub struct Resolver {
    primary: Arc<dyn Extractor>,
    mirror: Option<Arc<dyn Extractor>>,
    mirror_policy: MirrorPolicy,
    retries: u32,
}

impl Resolver {
    pub fn new(primary: Arc<dyn Extractor>) -> Self {
        Self {
            primary,
            mirror: None,
            mirror_policy: MirrorPolicy::Off,
            retries: 0,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn Extractor>, policy: MirrorPolicy) -> Self {
        self.mirror = Some(mirror);
        self.mirror_policy = policy;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub async fn resolve(&self, request: &MediaRequest) -> Result<MediaDescriptor, ResolveError> {
        ensure_http_url(&request.source_url)?;
        let format = request.format_expression();
        debug!(url = %request.source_url, kind = ?request.kind, %format, "resolving");

        let mirror = self.mirror_for(request);
        if let (Some(mirror), MirrorPolicy::Prefer) = (mirror, self.mirror_policy) {
            match self.resolve_with(mirror, request, &format).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(err) => {
                    debug!(url = %request.source_url, error = %err, "mirror miss, trying yt-dlp")
                }
            }
        }

        let primary = self.resolve_with(self.primary.as_ref(), request, &format).await;
        match (primary, mirror, self.mirror_policy) {
            (Err(err), Some(mirror), MirrorPolicy::Fallback) => {
                warn!(url = %request.source_url, error = %err, "primary extraction failed, trying mirror");
                self.resolve_with(mirror, request, &format)
                    .await
                    .map_err(|_| err)
            }
            (result, _, _) => result,
        }
    }

    fn mirror_for(&self, request: &MediaRequest) -> Option<&dyn Extractor> {
        if request.kind != MediaKind::Video || !is_mirrorable(&request.source_url) {
            return None;
        }
        self.mirror.as_deref()
    }

    async fn resolve_with(
        &self,
        extractor: &dyn Extractor,
        request: &MediaRequest,
        format: &str,
    ) -> Result<MediaDescriptor, ResolveError> {
        let mut attempt = 0;
        let info = loop {
            match extractor.extract(&request.source_url, format).await {
                Ok(info) => break info,
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(extractor = extractor.name(), attempt, error = %err, "retrying extraction");
                }
                Err(err) => return Err(err),
            }
        };

        let descriptor = build_descriptor(&info, request.kind)?;
        info!(
            extractor = extractor.name(),
            url = %request.source_url,
            title = descriptor.title(),
            ext = descriptor.extension(),
            "resolved"
        );
        Ok(descriptor)
    }
}

fn ensure_http_url(url: &Url) -> Result<(), ResolveError> {
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        _ => Err(ResolveError::InvalidOrUnsupportedUrl(url.to_string())),
    }
}

/// Parses caller input. Anything that is not an absolute http(s) URL is
/// rejected before an extractor is involved.
pub fn parse_source_url(raw: &str) -> Result<Url, ResolveError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ResolveError::InvalidOrUnsupportedUrl(format!("{raw}: {err}")))?;
    ensure_http_url(&url)?;
    Ok(url)
}

pub fn build_descriptor(info: &ExtractedInfo, kind: MediaKind) -> Result<MediaDescriptor, ResolveError> {
    let (url, ext, size) = select_direct_url(info, kind).ok_or(ResolveError::NoDirectUrlFound)?;
    MediaDescriptor::new(url, info.title.as_deref(), ext, kind, size)
        .ok_or(ResolveError::NoDirectUrlFound)
}

/// Direct URL plus the extension and size that belong to it. Priority:
/// top-level `url`, best entry of `formats`, first of `requested_formats`.
pub fn select_direct_url(info: &ExtractedInfo, kind: MediaKind) -> Option<(&str, Option<&str>, SizeHint)> {
    if let Some(url) = info.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        let size = SizeHint::new(info.filesize, info.filesize_approx);
        return Some((url, info.ext.as_deref(), size));
    }

    let best = info
        .formats
        .iter()
        .filter(|format| format.is_media() && format.usable_url().is_some())
        .max_by(|a, b| compare_formats(a, b, kind));
    if let Some(format) = best {
        return format
            .usable_url()
            .map(|url| (url, format.ext.as_deref().or(info.ext.as_deref()), format.size_hint()));
    }

    info.requested_formats.iter().find_map(|format| {
        format
            .usable_url()
            .map(|url| (url, format.ext.as_deref().or(info.ext.as_deref()), format.size_hint()))
    })
}

fn compare_formats(a: &FormatInfo, b: &FormatInfo, kind: MediaKind) -> Ordering {
    let bitrate = |format: &FormatInfo, audio: bool| {
        let value = if audio {
            format.abr.or(format.tbr)
        } else {
            format.tbr.or(format.abr)
        };
        value.unwrap_or(0.0)
    };
    match kind {
        MediaKind::Video => {
            let muxed = |format: &FormatInfo| format.has_video() && format.has_audio();
            muxed(a)
                .cmp(&muxed(b))
                .then_with(|| a.has_video().cmp(&b.has_video()))
                .then_with(|| a.height.unwrap_or(0).cmp(&b.height.unwrap_or(0)))
                .then_with(|| bitrate(a, false).total_cmp(&bitrate(b, false)))
        }
        MediaKind::AudioOnly => {
            let audio_only = |format: &FormatInfo| format.has_audio() && !format.has_video();
            audio_only(a)
                .cmp(&audio_only(b))
                .then_with(|| a.has_audio().cmp(&b.has_audio()))
                .then_with(|| bitrate(a, true).total_cmp(&bitrate(b, true)))
        }
    }
}
