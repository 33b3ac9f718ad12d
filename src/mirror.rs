#![forbid(unsafe_code)]

//! Optional Facebook reel strategy: fetch the page from a lightweight mirror
//! host and pull the video URL straight out of the HTML.
//!
//! The markup scraped here is not a stable contract. Every pattern is tried
//! in order and a miss simply reports `NoDirectUrlFound`, letting the resolver
//! move on to the next strategy.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::ResolveError;
use crate::extractor::{ExtractedInfo, Extractor};

const FACEBOOK_HOSTS: &[&str] = &["facebook.com", "www.facebook.com", "m.facebook.com", "web.facebook.com"];

static HD_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""browser_native_hd_url":"([^"]+)""#).expect("valid regex"));
static SD_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""browser_native_sd_url":"([^"]+)""#).expect("valid regex"));
static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<meta\s[^>]*>"#).expect("valid regex"));
static META_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(property|content)\s*=\s*"([^"]*)""#).expect("valid regex")
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorPolicy {
    /// Never scrape; yt-dlp only.
    #[default]
    Off,
    /// Scrape only after yt-dlp failed.
    Fallback,
    /// Scrape first, yt-dlp when scraping found nothing.
    Prefer,
}

impl MirrorPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Some(Self::Off),
            "fallback" => Some(Self::Fallback),
            "prefer" | "first" => Some(Self::Prefer),
            _ => None,
        }
    }
}

/// Rewrites a Facebook page URL onto `https://<mirror_host>`. Returns `None`
/// for any other platform.
pub fn mirror_url(source: &Url, mirror_host: &str) -> Option<Url> {
    let base = mirror_base(mirror_host).ok()?;
    mirror_url_on(source, &base)
}

/// Same as [`mirror_url`] but keeps scheme, host and port of `base`.
pub fn mirror_url_on(source: &Url, base: &Url) -> Option<Url> {
    let host = source.host_str()?.to_ascii_lowercase();
    if !FACEBOOK_HOSTS.contains(&host.as_str()) {
        return None;
    }
    let mut rewritten = base.clone();
    rewritten.set_path(source.path());
    rewritten.set_query(source.query());
    rewritten.set_fragment(None);
    Some(rewritten)
}

fn mirror_base(mirror_host: &str) -> Result<Url> {
    Url::parse(&format!("https://{}/", mirror_host.trim()))
        .with_context(|| format!("invalid mirror host `{mirror_host}`"))
}

pub fn is_mirrorable(source: &Url) -> bool {
    mirror_url(source, "mirror.invalid").is_some()
}

/// HD literal, then SD literal, then `og:video` meta tags.
pub fn scrape_video_url(html: &str) -> Option<String> {
    let literal = HD_LITERAL
        .captures(html)
        .or_else(|| SD_LITERAL.captures(html))
        .and_then(|captures| captures.get(1))
        .map(|raw| unescape_literal(raw.as_str()))
        .filter(|url| !url.is_empty());
    literal.or_else(|| {
        meta_content(html, "og:video:secure_url").or_else(|| meta_content(html, "og:video"))
    })
}

pub fn scrape_title(html: &str) -> Option<String> {
    meta_content(html, "og:title")
}

fn unescape_literal(raw: &str) -> String {
    raw.replace("\\u0025", "%").replace('\\', "")
}

fn meta_content(html: &str, property: &str) -> Option<String> {
    META_TAG.find_iter(html).find_map(|tag| {
        let mut found_property = None;
        let mut content = None;
        for captures in META_ATTR.captures_iter(tag.as_str()) {
            match &captures[1] {
                "property" => found_property = Some(captures[2].to_string()),
                "content" => content = Some(captures[2].to_string()),
                _ => {}
            }
        }
        if found_property.as_deref() == Some(property) {
            content
                .map(|value| value.replace("&amp;", "&"))
                .filter(|value| !value.trim().is_empty())
        } else {
            None
        }
    })
}

pub struct MirrorExtractor {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl MirrorExtractor {
    pub fn new(mirror_host: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        Self::with_base(mirror_base(mirror_host)?, user_agent, timeout)
    }

    /// Mirror served from an arbitrary origin, e.g. a plain-http test server.
    pub fn with_base(base: Url, user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("none"));

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building mirror http client")?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }
}

#[async_trait]
impl Extractor for MirrorExtractor {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn extract(&self, source_url: &Url, _format: &str) -> Result<ExtractedInfo, ResolveError> {
        let target = mirror_url_on(source_url, &self.base).ok_or_else(|| {
            ResolveError::InvalidOrUnsupportedUrl(format!("{source_url} has no mirror"))
        })?;
        debug!(url = %target, "fetching mirror page");

        let response = self.client.get(target.clone()).send().await.map_err(|err| {
            if err.is_timeout() {
                ResolveError::UpstreamTimeout(self.timeout)
            } else {
                ResolveError::ExtractionFailed(format!("fetching {target}: {err}"))
            }
        })?;
        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(ResolveError::ContentUnavailable(format!(
                "mirror returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ResolveError::ExtractionFailed(format!(
                "mirror returned {status}"
            )));
        }
        let html = response.text().await.map_err(|err| {
            if err.is_timeout() {
                ResolveError::UpstreamTimeout(self.timeout)
            } else {
                ResolveError::ExtractionFailed(format!("reading mirror page: {err}"))
            }
        })?;

        let url = scrape_video_url(&html).ok_or(ResolveError::NoDirectUrlFound)?;
        Ok(ExtractedInfo {
            url: Some(url),
            title: scrape_title(&html),
            ext: Some("mp4".to_string()),
            ..ExtractedInfo::default()
        })
    }
}
