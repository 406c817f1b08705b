pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building pushkins or talking to the upstream clouds.
///
/// Request-time delivery failures are not errors; they are folded into the
/// per-device [`Outcome`](crate::pushkin::Outcome) so one bad device cannot
/// fail a whole notification.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid credential material: {0}")]
    Credentials(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),

    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error(transparent)]
    SystemTime(#[from] std::time::SystemTimeError),
}
