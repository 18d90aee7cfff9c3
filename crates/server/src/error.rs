use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use ocrd::{LimitExceeded, OcrError};
use serde_json::json;

pub type ServerResult<T> = Result<T, ServerError>;

/// Request-surface error kinds, each mapped to one HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnsupportedMedia(String),

    #[error("File too large")]
    PayloadTooLarge,

    #[error("Overlay output is disabled")]
    OverlayDisabled,

    #[error(transparent)]
    Limited(#[from] LimitExceeded),

    #[error("{0}")]
    Unavailable(String),

    /// Inference runtime, rasterizer, or model failures.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::OverlayDisabled => StatusCode::FORBIDDEN,
            Self::Limited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic headers for rate-limit and quota rejections.
    fn limit_headers(limited: &LimitExceeded) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        };
        match limited {
            LimitExceeded::RateLimit {
                kind,
                limit,
                retry_after,
            } => {
                set(
                    &mut headers,
                    "retry-after",
                    retry_after.as_secs().max(1).to_string(),
                );
                set(&mut headers, "x-ratelimit-type", kind.as_str().to_string());
                set(&mut headers, "x-ratelimit-limit", limit.to_string());
            }
            LimitExceeded::Quota {
                kind,
                limit,
                used,
                resets_at,
            } => {
                set(&mut headers, "x-quota-type", kind.as_str().to_string());
                set(&mut headers, "x-quota-limit", limit.to_string());
                set(&mut headers, "x-quota-used", used.to_string());
                let http_date = resets_at
                    .with_timezone(&Utc)
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string();
                set(&mut headers, "x-quota-resets", http_date);
            }
        }
        headers
    }
}

impl From<OcrError> for ServerError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::InvalidInput(msg) => Self::BadRequest(msg),
            OcrError::ImageDecode(e) => Self::UnsupportedMedia(format!("image decode: {e}")),
            OcrError::Closed => Self::Unavailable("pipeline is closed".to_string()),
            OcrError::Inference(msg) => Self::Upstream(msg),
            OcrError::Pdf(msg) => Self::Upstream(msg),
            OcrError::ModelLoad { path, reason } => {
                Self::Internal(format!("model {}: {reason}", path.display()))
            }
            OcrError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // The wire contract is a stable {success:false, error} body; the
        // limited variants use machine-readable error identifiers and
        // push the human detail into headers.
        let (error_message, extra_headers) = match &self {
            Self::Limited(limited @ LimitExceeded::RateLimit { .. }) => (
                "rate_limit_exceeded".to_string(),
                Some(Self::limit_headers(limited)),
            ),
            Self::Limited(limited @ LimitExceeded::Quota { .. }) => (
                "quota_exceeded".to_string(),
                Some(Self::limit_headers(limited)),
            ),
            other => (other.to_string(), None),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
        }));
        let mut response = (status, body).into_response();
        if let Some(headers) = extra_headers {
            response.headers_mut().extend(headers);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocrd::{QuotaKind, WindowKind};
    use std::time::Duration;

    #[test]
    fn rate_limit_response_has_diagnostic_headers() {
        let err = ServerError::Limited(LimitExceeded::RateLimit {
            kind: WindowKind::Minute,
            limit: 10,
            retry_after: Duration::from_secs(42),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("retry-after").unwrap(), "42");
        assert_eq!(headers.get("x-ratelimit-type").unwrap(), "minute");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
    }

    #[test]
    fn quota_response_has_quota_headers() {
        let err = ServerError::Limited(LimitExceeded::Quota {
            kind: QuotaKind::Bytes,
            limit: 1000,
            used: 900,
            resets_at: chrono::Local::now(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-quota-type").unwrap(), "bytes");
        assert_eq!(headers.get("x-quota-limit").unwrap(), "1000");
        assert_eq!(headers.get("x-quota-used").unwrap(), "900");
        assert!(headers.get("x-quota-resets").is_some());
    }

    #[test]
    fn statuses_follow_error_kinds() {
        assert_eq!(
            ServerError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServerError::OverlayDisabled.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServerError::Unavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::Upstream("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
