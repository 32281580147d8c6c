//! Request routing dispatch module
//!
//! Entry point for HTTP request processing: sends uploads to the upload
//! handler, everything else to health probes or static files, and turns
//! upload failures into status codes.

use crate::config::AppState;
use crate::handler::static_files;
use crate::handler::upload::UploadError;
use crate::http;
use crate::logger;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_LENGTH, IF_NONE_MATCH, SERVER};
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;

const ALLOW_UPLOAD: &str = "POST, OPTIONS";

/// Request context encapsulating information needed for static responses
pub struct RequestContext<'a> {
    pub path: &'a str,
    pub is_head: bool,
    pub if_none_match: Option<String>,
}

/// Main entry point for HTTP request handling
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body + Send + 'static,
    B::Data: Into<Bytes> + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let mut response = route_request(req, &state).await;
    if let Ok(server) = HeaderValue::from_str(&state.config.http.server_name) {
        response.headers_mut().insert(SERVER, server);
    }
    Ok(response)
}

async fn route_request<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body + Send + 'static,
    B::Data: Into<Bytes> + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    // 1. Upload endpoint
    if is_upload_path(&path, &state.config.storage.upload_path) {
        match method {
            Method::POST => return handle_upload(req, state).await,
            Method::OPTIONS => return http::build_options_response(ALLOW_UPLOAD),
            _ => {}
        }
    }

    // 2. Only reads reach the public directory; anything else is a miss
    if method != Method::GET && method != Method::HEAD {
        logger::log_debug(&format!("No route for {method} {path}"));
        return http::build_404_response();
    }

    let ctx = RequestContext {
        path: &path,
        is_head: method == Method::HEAD,
        if_none_match: req
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string),
    };

    // 3. Health check endpoints
    let health = &state.config.health;
    if health.enabled && (ctx.path == health.liveness_path || ctx.path == health.readiness_path) {
        return http::build_health_response("ok", ctx.is_head);
    }

    // 4. Static assets
    static_files::serve_directory(&ctx, &state.public_dir, &state.config.storage.index_files).await
}

/// Case-insensitive match that tolerates one trailing slash
fn is_upload_path(path: &str, upload_path: &str) -> bool {
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
    path.eq_ignore_ascii_case(upload_path)
}

async fn handle_upload<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
    B: Body + Send + 'static,
    B::Data: Into<Bytes> + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    if let Some(resp) = check_body_size(&req, state.config.http.max_body_size) {
        return resp;
    }

    match state.uploads.accept(req).await {
        Ok(file) => {
            logger::log_upload_stored(&file);
            http::build_text_response(
                StatusCode::OK,
                format!("File uploaded successfully: {}", file.stored_name),
            )
        }
        Err(err) => {
            logger::log_upload_rejected(&err);
            upload_error_response(&err)
        }
    }
}

/// Translate an upload failure into its HTTP response
pub fn upload_error_response(err: &UploadError) -> Response<Full<Bytes>> {
    match err {
        UploadError::InvalidFileType { .. } => {
            http::build_text_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        UploadError::MalformedRequest(message) => http::build_text_response(
            StatusCode::BAD_REQUEST,
            format!("File upload error: {message}"),
        ),
        UploadError::StorageFailure(_) => {
            http::build_text_response(StatusCode::INTERNAL_SERVER_ERROR, "Error uploading file.")
        }
        UploadError::PayloadTooLarge { .. } => http::build_413_response(),
        UploadError::Other(message) => {
            http::build_text_response(StatusCode::BAD_REQUEST, message.clone())
        }
    }
}

/// Validate Content-Length header and return 413 if exceeded
fn check_body_size<B>(req: &Request<B>, max_body_size: u64) -> Option<Response<Full<Bytes>>> {
    let content_length = req.headers().get(CONTENT_LENGTH)?;
    content_length.to_str().map_or_else(
        |_| {
            logger::log_warning("Content-Length header contains non-ASCII characters");
            None
        },
        |size_str| match size_str.parse::<u64>() {
            Ok(size) if size > max_body_size => {
                logger::log_warning(&format!(
                    "Request body too large: {size} bytes (max: {max_body_size})"
                ));
                Some(http::build_413_response())
            }
            Err(_) => {
                logger::log_warning(&format!(
                    "Invalid Content-Length value: '{size_str}', skipping size check"
                ));
                None
            }
            _ => None,
        },
    )
}
