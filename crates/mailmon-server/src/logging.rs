use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Maximum number of bytes logged from a request or response body.
const MAX_BODY_LOG_BYTES: usize = 200;

/// Largest request body buffered for logging.
const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Trace id of the current request, stored in request extensions.
#[derive(Clone)]
pub struct TraceId(pub String);

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// 16 hex characters from 8 random bytes.
pub fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().fold(String::with_capacity(16), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn body_snippet(bytes: &[u8]) -> String {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return "<non-utf8 body>".to_string();
    };
    if text.len() <= MAX_BODY_LOG_BYTES {
        return text.to_string();
    }
    let mut end = MAX_BODY_LOG_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"))
}

fn format_elapsed(elapsed_us: u128) -> String {
    match elapsed_us {
        0..=999 => format!("{elapsed_us}µs"),
        1_000..=999_999 => format!("{}ms", elapsed_us / 1000),
        _ => format!("{:.1}s", elapsed_us as f64 / 1_000_000.0),
    }
}

/// Logs every request and response and tags the response with `X-Trace-Id`.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let req = if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .unwrap_or_default();
        tracing::info!(
            trace_id = %trace_id,
            method = %method,
            path = %path,
            body = %body_snippet(&bytes),
            "--> request"
        );
        Request::from_parts(parts, Body::from(bytes))
    } else {
        tracing::info!(trace_id = %trace_id, method = %method, path = %path, "--> request");
        req
    };

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = format_elapsed(start.elapsed().as_micros());
    let status = response.status();

    // Upgraded connections keep their body untouched.
    let mut response = if status == StatusCode::SWITCHING_PROTOCOLS {
        tracing::info!(trace_id = %trace_id, status = status.as_u16(), elapsed = %elapsed, "<-- upgrade");
        response
    } else {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .unwrap_or_default();
        let snippet = if is_json(&parts.headers) {
            body_snippet(&bytes)
        } else {
            String::new()
        };

        let code = status.as_u16();
        if status.is_server_error() {
            tracing::error!(trace_id = %trace_id, status = code, elapsed = %elapsed, body = %snippet, "<-- response");
        } else if status.is_client_error() {
            tracing::warn!(trace_id = %trace_id, status = code, elapsed = %elapsed, body = %snippet, "<-- response");
        } else {
            tracing::info!(trace_id = %trace_id, status = code, elapsed = %elapsed, "<-- response");
        }
        Response::from_parts(parts, Body::from(bytes))
    };

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_is_sixteen_hex_chars() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_trace_id());
    }

    #[test]
    fn body_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let snippet = body_snippet(long.as_bytes());
        assert!(snippet.ends_with("..."));
        assert!(snippet.len() <= MAX_BODY_LOG_BYTES + 3);
        assert_eq!(body_snippet(b"{\"ok\":true}"), "{\"ok\":true}");
        assert_eq!(body_snippet(&[0xff, 0xfe]), "<non-utf8 body>");
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(999), "999µs");
        assert_eq!(format_elapsed(12_345), "12ms");
        assert_eq!(format_elapsed(2_500_000), "2.5s");
    }
}
