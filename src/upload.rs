//! Request routing and the single-blob upload pipeline.
//!
//! One catch-all handler classifies the method, authenticates, and then
//! streams request bodies through the quota meter into a proto file. POST
//! bodies in a multipart envelope take a detour through [`crate::multipart`];
//! MOVE, COPY, and DELETE live in [`crate::webdav`].

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Extension, Request};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use percent_encoding::percent_decode_str;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::ScopeConfig;
use crate::error::UploadError;
use crate::multipart;
use crate::pathname;
use crate::protofile::{PersistError, ProtoFile};
use crate::quota::{Ceiling, TransactionMeter};
use crate::signature::{self, Clock};
use crate::storage::Storage;
use crate::webdav;

pub type SharedStorage = Arc<dyn Storage>;
pub type SharedClock = Arc<dyn Clock>;

/// Builds the router serving one upload scope.
pub fn app(config: Arc<ScopeConfig>, storage: SharedStorage, clock: SharedClock) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(DefaultBodyLimit::disable())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<Body>| {
                    info_span!(
                        "request",
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(config))
        .layer(Extension(storage))
        .layer(Extension(clock))
}

/// Gateway for everything under the scope; a passthrough for the rest.
pub(crate) async fn handle_request(
    Extension(config): Extension<Arc<ScopeConfig>>,
    Extension(storage): Extension<SharedStorage>,
    Extension(clock): Extension<SharedClock>,
    request: Request,
) -> Response {
    let raw_path = request.uri().path().to_string();
    let Ok(decoded) = percent_decode_str(&raw_path).decode_utf8() else {
        return UploadError::InvalidPath.into_response();
    };
    let path = decoded.into_owned();

    if !in_scope(&config.scope, &path) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let method = request.method().as_str().to_string();
    match method.as_str() {
        "POST" | "PUT" => {}
        "MOVE" | "COPY" | "DELETE" => {
            if !config.enable_webdav {
                return delegate(&config);
            }
        }
        // Reads are not this handler's responsibility.
        _ => return delegate(&config),
    }

    if let Err(err) = signature::authenticate(request.headers(), &config, clock.as_ref()) {
        // Only the auth taxonomy is silenced; anything else still reports.
        if config.silent_auth_errors && err.is_auth() {
            return delegate(&config);
        }
        return err.into_response();
    }

    match method.as_str() {
        "PUT" => serve_put(&config, storage.as_ref(), &path, request).await,
        "POST" => serve_post(&config, storage.as_ref(), &path, request).await,
        "MOVE" => respond(
            &config,
            webdav::serve_move(&config, storage.as_ref(), &path, request.headers()).await,
            &[],
        ),
        "COPY" => respond(
            &config,
            webdav::serve_copy(&config, storage.as_ref(), &path, request.headers()).await,
            &[],
        ),
        "DELETE" => respond(
            &config,
            webdav::serve_delete(&config, storage.as_ref(), &path).await,
            &[],
        ),
        _ => delegate(&config),
    }
}

/// Whether `path` lies under the configured scope, on a segment boundary.
fn in_scope(scope: &str, path: &str) -> bool {
    if scope == "/" {
        return true;
    }
    path == scope
        || path
            .strip_prefix(scope)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Stands in for handing the request to the next handler in a chain; this
/// server has none.
fn delegate(config: &ScopeConfig) -> Response {
    let allow = HeaderValue::from_static(if config.enable_webdav {
        "POST, PUT, MOVE, COPY, DELETE"
    } else {
        "POST, PUT"
    });
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, allow)],
        "method not allowed",
    )
        .into_response()
}

async fn serve_put(
    config: &ScopeConfig,
    storage: &dyn Storage,
    path: &str,
    request: Request,
) -> Response {
    let advertised = match advertised_length(request.headers()) {
        Ok(advertised) => advertised,
        Err(err) => return err.into_response(),
    };

    let mut meter = TransactionMeter::new(config.max_filesize, config.max_transaction_size);
    let mut source = BodySource::new(request.into_body());
    match write_one_blob(config, storage, &mut meter, path, advertised, &mut source).await {
        Ok(written) => respond(config, Ok(written.status), &[written.key]),
        Err(err) => err.into_response(),
    }
}

async fn serve_post(
    config: &ScopeConfig,
    storage: &dyn Storage,
    path: &str,
    request: Request,
) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        return multipart::serve(config, storage, path, request).await;
    }
    if !content_type.is_empty() {
        // Other envelope formats are not implemented.
        return UploadError::UnsupportedEnvelope.into_response();
    }
    serve_put(config, storage, path, request).await
}

/// A persisted upload and how to report it.
pub(crate) struct Written {
    pub status: StatusCode,
    pub key: String,
    pub bytes: u64,
}

/// Unit of work behind PUT and every multipart file part: translate the
/// name, stream through the quota ceiling into a proto file, persist.
///
/// Any failure discards the proto file; nothing appears under the final name.
pub(crate) async fn write_one_blob(
    config: &ScopeConfig,
    storage: &dyn Storage,
    meter: &mut TransactionMeter,
    url_path: &str,
    advertised: Option<u64>,
    source: &mut impl ChunkSource,
) -> Result<Written, UploadError> {
    let ceiling = meter.ceiling();
    if ceiling.limit == Some(0) {
        return Err(ceiling.to_error());
    }
    ceiling.check_advertised(advertised)?;

    let resolved = pathname::resolve(config, url_path, true)?;
    if resolved.is_root() {
        return Err(UploadError::NoDestination);
    }

    let mut proto = storage
        .create_proto(&resolved.dir, &resolved.filename)
        .await
        .map_err(|err| UploadError::Internal(err.to_string()))?;
    if let Some(length) = advertised {
        proto.size_will_be(length).await;
    }

    let written = match pump(source, &mut proto, &ceiling, advertised).await {
        Ok(written) => written,
        Err(err) => {
            proto.zap().await;
            return Err(err);
        }
    };

    match proto.persist().await {
        Ok(()) => {}
        Err(PersistError::Conflict) => return Err(UploadError::NameConflict),
        Err(PersistError::Io(err)) => return Err(UploadError::Internal(err.to_string())),
    }

    meter.consume(written);
    let status = match advertised {
        // The client announced more than it sent: accepted, not completed.
        Some(length) if written < length => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    info!(key = %resolved.key, bytes = written, "file persisted");
    Ok(Written { status, key: resolved.key, bytes: written })
}

/// Sequential chunks of one file's contents.
pub(crate) trait ChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, UploadError>;
}

pub(crate) struct BodySource {
    stream: http_body_util::BodyDataStream<Body>,
}

impl BodySource {
    pub(crate) fn new(body: Body) -> Self {
        Self { stream: BodyExt::into_data_stream(body) }
    }
}

impl ChunkSource for BodySource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, UploadError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(UploadError::Internal(err.to_string())),
        }
    }
}

/// Copies chunks into the proto file, aborting past the effective ceiling.
pub(crate) async fn pump(
    source: &mut impl ChunkSource,
    proto: &mut ProtoFile,
    ceiling: &Ceiling,
    advertised: Option<u64>,
) -> Result<u64, UploadError> {
    let mut written: u64 = 0;
    while let Some(chunk) = source.next_chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        written += chunk.len() as u64;
        if ceiling.exceeded_by(written) {
            return Err(ceiling.to_error());
        }
        if let Err(err) = proto.write_chunk(&chunk).await {
            // Bytes on disk but short of the announced size hints at
            // exhausted space.
            if written > 0 && advertised.is_some_and(|length| written < length) {
                return Err(UploadError::InsufficientStorage(err.to_string()));
            }
            return Err(UploadError::Internal(err.to_string()));
        }
    }
    Ok(written)
}

/// Reads the advertised `Content-Length`, if any.
pub(crate) fn advertised_length(headers: &HeaderMap) -> Result<Option<u64>, UploadError> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or(UploadError::LengthInvalid),
    }
}

/// Shapes the final response: status (or error) plus one `Location` header
/// per persisted key, kept even when a later part failed.
pub(crate) fn respond(
    config: &ScopeConfig,
    result: Result<StatusCode, UploadError>,
    keys: &[String],
) -> Response {
    let mut headers = HeaderMap::new();
    for key in keys {
        if let Some(location) = location_for(config, key)
            && let Ok(value) = HeaderValue::from_str(&location)
        {
            headers.append(header::LOCATION, value);
        }
    }
    match result {
        Ok(status) => (status, headers, String::new()).into_response(),
        Err(err) => {
            let mut response = err.into_response();
            response.headers_mut().extend(headers);
            response
        }
    }
}

/// Where the client can fetch `key` back from, if configured.
fn location_for(config: &ScopeConfig, key: &str) -> Option<String> {
    let prefix = config.apparent_location.as_deref()?;
    let joined = format!("{}/{}", prefix.trim_end_matches('/'), key);
    if joined.starts_with("//") {
        Some(format!("/{}", joined.trim_start_matches('/')))
    } else {
        Some(joined)
    }
}
