use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use tracing::warn;

use crate::config::DecoyConfig;

const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// A responder producing a fake response for denied requests. Tarpit wraps
/// another strategy; Drop ends the exchange with as little as the transport
/// allows.
#[derive(Debug, Clone)]
pub enum Decoy {
    Static {
        status: StatusCode,
        body: String,
        content_type: String,
    },
    Redirect {
        location: String,
    },
    Tarpit {
        min: Duration,
        max: Duration,
        inner: Box<Decoy>,
    },
    Drop,
}

impl Decoy {
    pub fn static_body(status_code: u16, body: &str, content_type: &str) -> Self {
        let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
        let content_type = if content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            content_type.to_string()
        };
        Decoy::Static {
            status,
            body: body.to_string(),
            content_type,
        }
    }

    pub fn static_from_file(
        status_code: u16,
        path: &str,
        content_type: &str,
    ) -> std::io::Result<Self> {
        let body = std::fs::read_to_string(path)?;
        Ok(Self::static_body(status_code, &body, content_type))
    }

    pub fn redirect(location: &str) -> Self {
        Decoy::Redirect {
            location: location.to_string(),
        }
    }

    pub fn tarpit(min: Duration, max: Duration, inner: Decoy) -> Self {
        Decoy::Tarpit {
            min,
            max,
            inner: Box::new(inner),
        }
    }

    /// Select the profile's strategy at load time. A file-backed static body
    /// falls back to the inline body when the file cannot be read.
    pub fn from_config(cfg: &DecoyConfig) -> Self {
        match cfg.mode.to_lowercase().as_str() {
            "static" => {
                if let Some(path) = cfg.body_file.as_deref().filter(|p| !p.is_empty()) {
                    match Self::static_from_file(cfg.status_code, path, "") {
                        Ok(decoy) => return decoy,
                        Err(e) => {
                            warn!("failed to read decoy body file {}: {}", path, e);
                        }
                    }
                }
                Self::static_body(cfg.status_code, &cfg.body, "")
            }
            "redirect" => Self::redirect(cfg.redirect_to.as_deref().unwrap_or("")),
            _ => Self::static_body(200, "", ""),
        }
    }

    /// Produce the response. Only Tarpit suspends.
    pub async fn serve(&self) -> Response {
        if let Decoy::Tarpit { min, max, inner } = self {
            let delay = if max > min {
                rand::thread_rng().gen_range(*min..=*max)
            } else {
                *min
            };
            tokio::time::sleep(delay).await;
            return inner.immediate_response();
        }
        self.immediate_response()
    }

    fn immediate_response(&self) -> Response {
        match self {
            Decoy::Static {
                status,
                body,
                content_type,
            } => {
                let mut response = (*status, body.clone()).into_response();
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                response
            }
            Decoy::Redirect { location } => {
                let mut response = StatusCode::FOUND.into_response();
                if let Ok(value) = HeaderValue::from_str(location) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
                response
            }
            Decoy::Tarpit { inner, .. } => inner.immediate_response(),
            Decoy::Drop => {
                // The transport forces a status line; answer with the empty
                // 444 convention and refuse connection reuse.
                let status =
                    StatusCode::from_u16(444).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut response = Response::new(Body::empty());
                *response.status_mut() = status;
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::time::Instant;

    #[tokio::test]
    async fn test_static_decoy() {
        let decoy = Decoy::static_body(200, "decoy response", "");
        let response = decoy.serve().await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"decoy response");
    }

    #[tokio::test]
    async fn test_static_decoy_zero_status_defaults_to_200() {
        let decoy = Decoy::static_body(0, "x", "");
        assert_eq!(decoy.serve().await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_static_from_missing_file_falls_back() {
        let cfg = DecoyConfig {
            mode: "static".to_string(),
            status_code: 200,
            body: "inline".to_string(),
            body_file: Some("/nonexistent/decoy.html".to_string()),
            redirect_to: None,
        };

        let decoy = Decoy::from_config(&cfg);
        let response = decoy.serve().await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"inline");
    }

    #[tokio::test]
    async fn test_redirect_decoy() {
        let decoy = Decoy::redirect("https://example.com/");
        let response = decoy.serve().await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com/"
        );
    }

    #[tokio::test]
    async fn test_tarpit_delays_then_delegates() {
        let inner = Decoy::static_body(200, "slow", "");
        let decoy = Decoy::tarpit(
            Duration::from_millis(30),
            Duration::from_millis(60),
            inner,
        );

        let start = Instant::now();
        let response = decoy.serve().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_drop_decoy() {
        let response = Decoy::Drop.serve().await;
        assert_eq!(response.status().as_u16(), 444);
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_from_config_unknown_mode_defaults_to_empty_static() {
        let decoy = Decoy::from_config(&DecoyConfig::default());
        let response = decoy.serve().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
