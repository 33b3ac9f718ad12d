#![forbid(unsafe_code)]

//! Axum front end for the relay.
//!
//! Every request resolves its `url` parameter from scratch; nothing is cached
//! between requests. `/download/*` hands the media back by proxy, redirect or
//! an auto-redirecting HTML page, `/api/*` only describes it as JSON.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use futures::TryStreamExt;
use mediarelay::{
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    error::{ResolveError, StreamError},
    extractor::YtDlpExtractor,
    logging::init_logging,
    media::{DeliveryMode, MediaDescriptor, MediaKind, MediaRequest},
    mirror::{MirrorExtractor, MirrorPolicy},
    resolver::{Resolver, parse_source_url},
    security::ensure_unprivileged,
    streamer::{FetchOptions, StreamConfig, Streamer},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "backend",
    about = "Resolve social-media video URLs and relay the media"
)]
struct BackendArgs {
    /// Listen address (overrides MEDIARELAY_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (overrides MEDIARELAY_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Alternate .env file.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    /// yt-dlp executable (overrides YTDLP_PATH).
    #[arg(long)]
    ytdlp: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            ytdlp_path: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEDIARELAY_HOST")
}

/// Shared state injected into every handler. Built once in `main`.
#[derive(Clone)]
struct AppState {
    resolver: Arc<Resolver>,
    streamer: Arc<Streamer>,
    default_mode: DeliveryMode,
}

impl AppState {
    fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        let ytdlp = YtDlpExtractor::new(
            settings.ytdlp_path.clone(),
            settings.user_agent.clone(),
            settings.resolve_timeout,
        )
        .with_cookies(settings.cookies_file.clone());
        let mut resolver = Resolver::new(Arc::new(ytdlp)).with_retries(settings.resolve_retries);

        if settings.mirror_policy != MirrorPolicy::Off {
            let mirror = MirrorExtractor::new(
                &settings.mirror_host,
                &settings.user_agent,
                settings.resolve_timeout,
            )
            .context("building mirror client")?;
            resolver = resolver.with_mirror(Arc::new(mirror), settings.mirror_policy);
        }

        let streamer = Streamer::new(StreamConfig {
            chunk_size: settings.chunk_size,
            timeout: settings.stream_timeout,
            user_agent: settings.user_agent.clone(),
        })
        .context("building upstream client")?;

        Ok(Self {
            resolver: Arc::new(resolver),
            streamer: Arc::new(streamer),
            default_mode: settings.delivery_mode,
        })
    }
}

/// Error body for `/download/*`: `{"detail": ..., "code": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
}

impl ApiError {
    /// Helper for 400 responses.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: "BAD_REQUEST",
        }
    }

    /// Helper for 404 responses.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: "NOT_FOUND",
        }
    }

    /// Helper for 502 responses caused by the media host.
    fn bad_gateway(message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
            code,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status = match err {
            ResolveError::NoDirectUrlFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
            code: err.code(),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        Self::bad_gateway(err.to_string(), err.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "detail": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Error body for `/api/*`: `{"success": false, "error": ..., "code": ...}`,
/// always 400.
#[derive(Debug)]
struct JsonApiError {
    message: String,
    code: &'static str,
}

impl From<ApiError> for JsonApiError {
    fn from(err: ApiError) -> Self {
        Self {
            message: err.message,
            code: err.code,
        }
    }
}

impl From<ResolveError> for JsonApiError {
    fn from(err: ResolveError) -> Self {
        Self {
            message: err.to_string(),
            code: err.code(),
        }
    }
}

impl IntoResponse for JsonApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    mode: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InfoQuery {
    url: Option<String>,
    kind: Option<String>,
    quality: Option<String>,
}

#[derive(Serialize)]
struct ResolvedPayload {
    success: bool,
    title: String,
    download_url: String,
    ext: String,
}

impl From<&MediaDescriptor> for ResolvedPayload {
    fn from(descriptor: &MediaDescriptor) -> Self {
        Self {
            success: true,
            title: descriptor.title().to_string(),
            download_url: descriptor.direct_url().to_string(),
            ext: descriptor.extension().to_string(),
        }
    }
}

#[derive(Serialize)]
struct InfoPayload {
    #[serde(flatten)]
    resolved: ResolvedPayload,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    kind: MediaKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let args = BackendArgs::parse();
    ensure_unprivileged("backend")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    let host = parse_host_arg(&settings.host)?;
    let state = AppState::from_settings(&settings)?;
    info!(
        ytdlp = %settings.ytdlp_path.display(),
        mode = ?settings.delivery_mode,
        mirror = ?settings.mirror_policy,
        chunk_size = settings.chunk_size,
        "relay configured"
    );

    let app = build_router(state);
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION, header::LOCATION]);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/download/video", get(download_video))
        .route("/download/audio", get(download_audio))
        .route("/api/video", get(api_video))
        .route("/api/audio", get(api_audio))
        .route("/api/info", get(api_info))
        .fallback(fallback)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Social media video relay. Use /download/video?url=... to fetch a file.",
        "supported": ["Facebook", "YouTube", "TikTok"],
        "endpoints": {
            "download_video": "/download/video?url=<link>&mode=proxy|redirect|page",
            "download_audio": "/download/audio?url=<link>&mode=proxy|redirect|page",
            "api_video": "/api/video?url=<link>",
            "api_audio": "/api/audio?url=<link>",
            "api_info": "/api/info?url=<link>&kind=video|audio",
            "health": "/health",
        },
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    deliver(state, MediaKind::Video, query, &headers).await
}

async fn download_audio(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    deliver(state, MediaKind::AudioOnly, query, &headers).await
}

async fn api_video(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<ResolvedPayload>, JsonApiError> {
    let request = media_request(query.url.as_deref(), MediaKind::Video, query.quality)?;
    let descriptor = state.resolver.resolve(&request).await?;
    Ok(Json(ResolvedPayload::from(&descriptor)))
}

async fn api_audio(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<ResolvedPayload>, JsonApiError> {
    let request = media_request(query.url.as_deref(), MediaKind::AudioOnly, query.quality)?;
    let descriptor = state.resolver.resolve(&request).await?;
    Ok(Json(ResolvedPayload::from(&descriptor)))
}

async fn api_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<InfoPayload>, JsonApiError> {
    let kind = match query.kind.as_deref() {
        Some(raw) => MediaKind::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown kind `{raw}`")))?,
        None => MediaKind::Video,
    };
    let request = media_request(query.url.as_deref(), kind, query.quality)?;
    let descriptor = state.resolver.resolve(&request).await?;
    Ok(Json(InfoPayload {
        resolved: ResolvedPayload::from(&descriptor),
        filesize: descriptor.filesize(),
        filesize_approx: descriptor.size().approx,
        kind,
    }))
}

/// Validates the `url` query parameter and builds the resolution request.
fn media_request(
    raw_url: Option<&str>,
    kind: MediaKind,
    quality: Option<String>,
) -> ApiResult<MediaRequest> {
    let raw_url = raw_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing required query parameter `url`"))?;
    let source_url = parse_source_url(raw_url)?;
    Ok(MediaRequest::new(source_url, kind).with_quality(quality))
}

async fn deliver(
    state: AppState,
    kind: MediaKind,
    query: MediaQuery,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let mode = match query.mode.as_deref() {
        Some(raw) => DeliveryMode::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown mode `{raw}`")))?,
        None => state.default_mode,
    };
    let request = media_request(query.url.as_deref(), kind, query.quality)?;
    let descriptor = state.resolver.resolve(&request).await?;
    info!(url = %request.source_url, ?mode, file = %descriptor.filename(), "delivering");

    match mode {
        DeliveryMode::Redirect => redirect_response(&descriptor),
        DeliveryMode::Page => page_response(&descriptor),
        DeliveryMode::Proxy => proxy_response(&state, &request, &descriptor, headers).await,
    }
}

/// Converts resolved data into a header value, failing as a gateway error.
fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::bad_gateway("resolved url is not a valid header value", "BAD_DIRECT_URL"))
}

fn redirect_response(descriptor: &MediaDescriptor) -> ApiResult<Response> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, header_value(descriptor.direct_url())?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&descriptor.content_disposition())?,
    );
    Ok(response)
}

fn page_response(descriptor: &MediaDescriptor) -> ApiResult<Response> {
    let target = escape_html(descriptor.direct_url());
    let filename = escape_html(&descriptor.filename());
    let page = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"0;url={target}\">\
         <title>{filename}</title></head>\
         <body><p>Redirecting to <a href=\"{target}\" download=\"{filename}\">{filename}</a></p>\
         <script>window.location.replace(document.querySelector('a').href);</script>\
         </body></html>\n"
    );
    let mut response = Response::new(Body::from(page));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    Ok(response)
}

async fn proxy_response(
    state: &AppState,
    request: &MediaRequest,
    descriptor: &MediaDescriptor,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let options = FetchOptions {
        range: headers.get(header::RANGE).cloned(),
        referer: Some(referer_for(&request.source_url)),
    };
    let upstream = state.streamer.open(descriptor.direct_url(), &options).await?;

    let partial = upstream.status == StatusCode::PARTIAL_CONTENT;
    let source = request.source_url.clone();
    let chunks = upstream.chunks.inspect_err(move |err| {
        warn!(url = %source, error = %err, "upstream stream aborted");
    });

    let mut response = Response::new(Body::from_stream(chunks));
    if partial {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }
    let out = response.headers_mut();
    out.insert(header::CONTENT_TYPE, header_value(&descriptor.content_type())?);
    out.insert(
        header::CONTENT_DISPOSITION,
        header_value(&descriptor.content_disposition())?,
    );
    // Hyper frames the body with this value, so estimates must never land here.
    let length = if partial {
        upstream.content_length
    } else {
        upstream.content_length.or(descriptor.filesize())
    };
    if let Some(length) = length {
        out.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(range) = upstream.content_range {
        out.insert(header::CONTENT_RANGE, range);
    }
    if let Some(accept) = upstream.accept_ranges {
        out.insert(header::ACCEPT_RANGES, accept);
    }
    Ok(response)
}

/// Origin of the page the media came from, e.g. `https://www.facebook.com/`.
fn referer_for(source: &Url) -> String {
    format!("{}/", source.origin().ascii_serialization())
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::Request};
    use bytes::Bytes;
    use mediarelay::extractor::{ExtractedInfo, Extractor};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Extractor double: a fixed payload, or a failure message that goes
    /// through the same classification as yt-dlp stderr.
    struct StaticExtractor {
        info: Option<ExtractedInfo>,
        failure: Option<&'static str>,
    }

    #[async_trait]
    impl Extractor for StaticExtractor {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn extract(&self, _source: &Url, _format: &str) -> Result<ExtractedInfo, ResolveError> {
            if let Some(message) = self.failure {
                return Err(ResolveError::classify(message));
            }
            Ok(self.info.clone().unwrap_or_default())
        }
    }

    fn media(url: &str, title: &str, ext: &str) -> ExtractedInfo {
        ExtractedInfo {
            url: Some(url.into()),
            title: Some(title.into()),
            ext: Some(ext.into()),
            ..ExtractedInfo::default()
        }
    }

    fn state_with(extractor: StaticExtractor, default_mode: DeliveryMode) -> AppState {
        let streamer = Streamer::new(StreamConfig {
            chunk_size: 16 * 1024,
            timeout: Duration::from_secs(30),
            user_agent: "test-agent".into(),
        })
        .unwrap();
        AppState {
            resolver: Arc::new(Resolver::new(Arc::new(extractor))),
            streamer: Arc::new(streamer),
            default_mode,
        }
    }

    fn resolving_to(info: ExtractedInfo, mode: DeliveryMode) -> Router {
        build_router(state_with(
            StaticExtractor {
                info: Some(info),
                failure: None,
            },
            mode,
        ))
    }

    fn uri(path: &str, params: &[(&str, &str)]) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        format!("{path}?{query}")
    }

    async fn get_response(app: Router, target: &str, headers: &[(&str, &str)]) -> Response {
        let mut builder = Request::builder().method("GET").uri(target);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 241) as u8).collect()
    }

    async fn media_upstream(len: usize) -> String {
        let body = Bytes::from(payload(len));
        spawn_upstream(Router::new().route(
            "/v.mp4",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        ))
        .await
    }

    const SOURCE: &str = "https://www.youtube.com/watch?v=alpha";

    #[test]
    fn backend_args_parse_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--env-file",
            "/etc/relay.env",
            "--ytdlp",
            "/opt/yt-dlp",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/relay.env")));
        assert_eq!(overrides.ytdlp_path, Some(PathBuf::from("/opt/yt-dlp")));
    }

    #[test]
    fn backend_args_reject_unknown_flags() {
        assert!(BackendArgs::try_parse_from(["backend", "--media-root", "/yt"]).is_err());
        assert!(BackendArgs::try_parse_from(["backend", "--port", "huge"]).is_err());
    }

    #[test]
    fn host_arg_must_be_an_ip() {
        assert!(parse_host_arg("127.0.0.1").is_ok());
        assert!(parse_host_arg("::1").is_ok());
        assert!(parse_host_arg("localhost").is_err());
    }

    #[test]
    fn escape_html_covers_attribute_breakers() {
        assert_eq!(
            escape_html(r#"https://x/?a=1&b="2"<'3'>"#),
            "https://x/?a=1&amp;b=&quot;2&quot;&lt;&#39;3&#39;&gt;"
        );
    }

    #[test]
    fn referer_is_source_origin() {
        let source = Url::parse("https://www.facebook.com/reel/123?x=1").unwrap();
        assert_eq!(referer_for(&source), "https://www.facebook.com/");
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = get_response(app, "/health", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn unknown_paths_are_json_404() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = get_response(app, "/nope", &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["detail"], "endpoint not found");
    }

    #[tokio::test]
    async fn proxy_streams_with_attachment_headers() {
        const LEN: usize = 300 * 1024 + 7;
        let base = media_upstream(LEN).await;
        let app = resolving_to(
            media(&format!("{base}/v.mp4"), "My Cool Video!!", "mp4"),
            DeliveryMode::Proxy,
        );

        let response = get_response(app, &uri("/download/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My_Cool_Video__.mp4\""
        );
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CONTENT_LENGTH], LEN.to_string().as_str());

        let body = body_bytes(response).await;
        assert_eq!(body.len(), LEN);
        assert_eq!(body.as_ref(), payload(LEN).as_slice());
    }

    #[tokio::test]
    async fn redirect_mode_points_at_direct_url_verbatim() {
        let direct = "https://cdn.example/v.mp4?sig=a%2Fb&exp=1";
        let app = resolving_to(media(direct, "My Cool Video!!", "mp4"), DeliveryMode::Proxy);
        let response = get_response(
            app,
            &uri("/download/video", &[("url", SOURCE), ("mode", "redirect")]),
            &[],
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], direct);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My_Cool_Video__.mp4\""
        );
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn configured_default_mode_applies_without_query() {
        let app = resolving_to(
            media("https://cdn.example/a.m4a", "Song", "m4a"),
            DeliveryMode::Redirect,
        );
        let response = get_response(app, &uri("/download/audio", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Song.m4a\""
        );
    }

    #[tokio::test]
    async fn page_mode_embeds_escaped_target() {
        let app = resolving_to(
            media("https://cdn.example/v.mp4?a=1&b=2", "clip", "mp4"),
            DeliveryMode::Proxy,
        );
        let response = get_response(
            app,
            &uri("/download/video", &[("url", SOURCE), ("mode", "page")]),
            &[],
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        let html = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(html.contains("content=\"0;url=https://cdn.example/v.mp4?a=1&amp;b=2\""));
        assert!(html.contains("clip.mp4"));
    }

    async fn chunked_upstream(len: usize) -> String {
        spawn_upstream(Router::new().route(
            "/v.mp4",
            get(move || async move {
                let pieces = payload(len)
                    .chunks(100)
                    .map(|piece| Ok::<_, std::io::Error>(Bytes::copy_from_slice(piece)))
                    .collect::<Vec<_>>();
                Body::from_stream(futures::stream::iter(pieces))
            }),
        ))
        .await
    }

    #[tokio::test]
    async fn approximate_filesize_never_frames_the_body() {
        let base = chunked_upstream(1000).await;
        let mut info = media(&format!("{base}/v.mp4"), "clip", "mp4");
        info.filesize_approx = Some(5000);
        let relay = spawn_upstream(resolving_to(info, DeliveryMode::Proxy)).await;

        let response = reqwest::get(format!("{relay}{}", uri("/download/video", &[("url", SOURCE)])))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        let body = response.bytes().await.unwrap();
        assert_eq!(body.as_ref(), payload(1000).as_slice());
    }

    #[tokio::test]
    async fn exact_filesize_frames_chunked_upstream() {
        let base = chunked_upstream(1000).await;
        let mut info = media(&format!("{base}/v.mp4"), "clip", "mp4");
        info.filesize = Some(1000);
        info.filesize_approx = Some(5000);
        let relay = spawn_upstream(resolving_to(info, DeliveryMode::Proxy)).await;

        let response = reqwest::get(format!("{relay}{}", uri("/download/video", &[("url", SOURCE)])))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.bytes().await.unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn range_requests_pass_through() {
        let base = spawn_upstream(Router::new().route(
            "/v.mp4",
            get(|headers: HeaderMap| async move {
                assert_eq!(headers[header::RANGE], "bytes=2-5");
                axum::http::Response::builder()
                    .status(206)
                    .header(header::CONTENT_RANGE, "bytes 2-5/10")
                    .header(header::ACCEPT_RANGES, "bytes")
                    .body(Body::from("cdef"))
                    .unwrap()
            }),
        ))
        .await;
        let mut info = media(&format!("{base}/v.mp4"), "clip", "mp4");
        info.filesize = Some(10);
        let app = resolving_to(info, DeliveryMode::Proxy);

        let response = get_response(
            app,
            &uri("/download/video", &[("url", SOURCE)]),
            &[("range", "bytes=2-5")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body_bytes(response).await.as_ref(), b"cdef");
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let base = spawn_upstream(Router::new().route(
            "/v.mp4",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let app = resolving_to(media(&format!("{base}/v.mp4"), "clip", "mp4"), DeliveryMode::Proxy);
        let response = get_response(app, &uri("/download/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["code"], "UPSTREAM_STATUS");
        assert!(body["detail"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn missing_direct_url_is_404_on_download() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = get_response(app, &uri("/download/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NO_DIRECT_URL_FOUND");
    }

    #[tokio::test]
    async fn resolution_failures_are_400_on_download() {
        let app = build_router(state_with(
            StaticExtractor {
                info: None,
                failure: Some("ERROR: [facebook] 1: This video is unavailable"),
            },
            DeliveryMode::Proxy,
        ));
        let response = get_response(app, &uri("/download/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "CONTENT_UNAVAILABLE");
        assert!(body["detail"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn download_requires_url_and_valid_mode() {
        let app = resolving_to(media("https://cdn/x", "x", "mp4"), DeliveryMode::Proxy);
        let response = get_response(app.clone(), "/download/video", &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            body_json(response).await["detail"]
                .as_str()
                .unwrap()
                .contains("`url`")
        );

        let response = get_response(
            app.clone(),
            &uri("/download/video", &[("url", SOURCE), ("mode", "fax")]),
            &[],
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get_response(
            app,
            &uri("/download/video", &[("url", "javascript:alert(1)")]),
            &[],
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_OR_UNSUPPORTED_URL");
    }

    #[tokio::test]
    async fn api_video_describes_media() {
        let app = resolving_to(
            media("https://cdn.example/v.mp4", "My Cool Video!!", "mp4"),
            DeliveryMode::Proxy,
        );
        let response = get_response(app, &uri("/api/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({
                "success": true,
                "title": "My_Cool_Video__",
                "download_url": "https://cdn.example/v.mp4",
                "ext": "mp4",
            })
        );
    }

    #[tokio::test]
    async fn api_audio_remaps_video_container() {
        let app = resolving_to(media("https://cdn.example/a", "Song", "mp4"), DeliveryMode::Proxy);
        let response = get_response(app, &uri("/api/audio", &[("url", SOURCE)]), &[]).await;
        assert_eq!(body_json(response).await["ext"], "m4a");
    }

    #[tokio::test]
    async fn api_video_without_usable_url_is_400() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = get_response(app, &uri("/api/video", &[("url", SOURCE)]), &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_missing_url_keeps_json_shape() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = get_response(app, "/api/audio", &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn api_info_reports_size_and_kind() {
        let mut info = media("https://cdn.example/a.opus", "Song", "opus");
        info.filesize_approx = Some(2048);
        let app = resolving_to(info, DeliveryMode::Proxy);
        let response = get_response(
            app.clone(),
            &uri("/api/info", &[("url", SOURCE), ("kind", "audio")]),
            &[],
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["ext"], "opus");
        assert_eq!(body["filesize"], Value::Null);
        assert_eq!(body["filesize_approx"], 2048);
        assert_eq!(body["kind"], "audio_only");

        let response = get_response(
            app,
            &uri("/api/info", &[("url", SOURCE), ("kind", "hologram")]),
            &[],
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cors_exposes_content_disposition() {
        let app = resolving_to(media("https://cdn.example/v.mp4", "clip", "mp4"), DeliveryMode::Proxy);
        let response = get_response(
            app,
            &uri("/download/video", &[("url", SOURCE), ("mode", "redirect")]),
            &[("origin", "https://frontend.example")],
        )
        .await;
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let exposed = headers[header::ACCESS_CONTROL_EXPOSE_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(exposed.contains("content-disposition"));
        assert!(exposed.contains("location"));
    }

    #[tokio::test]
    async fn cors_preflight_allows_any_method() {
        let app = resolving_to(ExtractedInfo::default(), DeliveryMode::Proxy);
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/video")
                    .header("origin", "https://frontend.example")
                    .header("access-control-request-method", "DELETE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "*"
        );
    }
}
