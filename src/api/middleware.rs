use std::time::Instant;

use axum::{body::Body, extract::Request, middleware::Next};
use http::{HeaderName, HeaderValue, Response};
use uuid::Uuid;

const REQUEST_ID: &str = "x-request-id";

/// Logs every request and stamps the response with its request id and the
/// standard hardening headers.
pub async fn request_context(request: Request, next: Next) -> Response<Body> {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    tracing::info!(request_id = %request_id, method = %method, path = %path, "incoming request");
    let mut response = next.run(request).await;
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %response.status(),
        latency_ms = started_at.elapsed().as_millis(),
        "request completed"
    );

    attach_hardening_headers(&request_id, &mut response);
    response
}

fn attach_hardening_headers(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID), value);
    }

    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
