use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::http_client::ClientFactory;
use crate::metrics::Metrics;
use crate::notification::{Device, Notification};

pub mod apns;
pub mod fcm;
pub mod oauth;
pub mod token;
pub mod vapid;
pub mod webpush;

/// How long a single device (or batch) dispatch may take end to end.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts for transport-level failures before giving up on a dispatch.
const TRANSPORT_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Per-device result of a dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream cloud accepted the notification.
    Delivered,

    /// The pushkey is permanently unusable; the homeserver should drop the
    /// pusher.
    Rejected { reason: String },

    /// A transient failure; the homeserver should resend the notification.
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
}

impl Outcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Outcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn retryable_after(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Outcome::Retryable {
            reason: reason.into(),
            retry_after,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Rejected { .. } => "rejected",
            Outcome::Retryable { .. } => "retryable",
        }
    }
}

/// One upstream-cloud backend.
///
/// Implementations receive at most [`Pushkin::max_batch_size`] devices per
/// call and must return one [`Outcome`] per device, in order. Transport
/// retries happen inside the implementation; admission control, timeouts and
/// the degraded window are applied by [`PushkinInstance`].
#[async_trait]
pub trait Pushkin: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Devices an implementation can fold into one upstream call.
    fn max_batch_size(&self) -> usize {
        1
    }

    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome>;

    async fn shutdown(&self) {}
}

/// Marks a pushkin unusable for a short window after the upstream rejected
/// its credentials, so a bad key does not hammer the cloud on every device.
#[derive(Debug, Default)]
pub struct Degraded {
    until: Mutex<Option<Instant>>,
}

impl Degraded {
    pub const WINDOW: Duration = Duration::from_secs(30);

    pub fn trip(&self) {
        *self.until.lock().unwrap() = Some(Instant::now() + Self::WINDOW);
    }

    pub fn active(&self) -> bool {
        let mut until = self.until.lock().unwrap();
        match *until {
            Some(t) if Instant::now() < t => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }
}

/// A configured pushkin plus the shared machinery wrapped around every
/// dispatch: the admission semaphore, the degraded window and the metrics
/// handles. Owned by the registry for the life of the process.
pub struct PushkinInstance {
    name: String,
    pushkin: Box<dyn Pushkin>,
    semaphore: Arc<Semaphore>,
    degraded: Arc<Degraded>,
    metrics: Arc<Metrics>,
}

impl PushkinInstance {
    /// Builds the pushkin named by one `apps` entry.
    pub fn build(
        name: &str,
        config: &AppConfig,
        factory: &ClientFactory,
        metrics: &Arc<Metrics>,
    ) -> Result<Self> {
        let degraded = Arc::new(Degraded::default());
        let pushkin: Box<dyn Pushkin> = match config {
            AppConfig::Apns(c) => Box::new(apns::ApnsPushkin::new(
                name,
                c,
                factory,
                metrics,
                degraded.clone(),
            )?),
            AppConfig::Fcm(c) => {
                Box::new(fcm::FcmPushkin::new(name, c, factory, degraded.clone())?)
            }
            AppConfig::WebPush(c) => Box::new(webpush::WebPushPushkin::new(
                name,
                c,
                factory,
                degraded.clone(),
            )?),
        };

        Ok(Self {
            name: name.to_owned(),
            pushkin,
            semaphore: Arc::new(Semaphore::new(config.inflight_request_limit())),
            degraded,
            metrics: metrics.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.pushkin.kind()
    }

    pub fn max_batch_size(&self) -> usize {
        self.pushkin.max_batch_size().max(1)
    }

    /// Dispatches one batch, applying the degraded window, admission control
    /// and the dispatch timeout. Always returns `devices.len()` outcomes.
    pub async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome> {
        let outcomes = self.guarded_dispatch(notification, devices).await;
        for outcome in &outcomes {
            self.metrics
                .device_outcomes
                .with_label_values(&[self.name.as_str(), outcome.label()])
                .inc();
        }
        self.metrics
            .devices_dispatched
            .with_label_values(&[self.name.as_str()])
            .inc_by(devices.len() as u64);
        outcomes
    }

    async fn guarded_dispatch(
        &self,
        notification: &Notification,
        devices: &[Device],
    ) -> Vec<Outcome> {
        if self.degraded.active() {
            return vec![Outcome::retryable("pushkin degraded"); devices.len()];
        }

        // Admission control, not queueing: the homeserver is the queue.
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics
                    .inflight_request_limit_drop
                    .with_label_values(&[self.name.as_str()])
                    .inc();
                warn!(pushkin = %self.name, "in-flight request limit reached, dropping");
                return vec![Outcome::retryable("in-flight request limit reached"); devices.len()];
            }
        };

        let result = tokio::time::timeout(
            DISPATCH_TIMEOUT,
            self.pushkin.dispatch(notification, devices),
        )
        .await;
        drop(permit);

        match result {
            Ok(outcomes) => {
                debug_assert_eq!(outcomes.len(), devices.len());
                outcomes
            }
            Err(_) => {
                warn!(pushkin = %self.name, "dispatch timed out");
                vec![Outcome::retryable("dispatch timed out"); devices.len()]
            }
        }
    }

    pub async fn shutdown(&self) {
        self.pushkin.shutdown().await;
    }
}

/// Runs `send` up to three times, backing off 250 ms, 500 ms, 1 s (with
/// jitter) between attempts. Only transport failures reach the `Err` arm;
/// upstream status codes come back as `Ok` and are never retried here.
pub(crate) async fn send_with_retries<F, Fut>(
    send: F,
) -> std::result::Result<reqwest::Response, reqwest_middleware::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest_middleware::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match send().await {
            Ok(response) => return Ok(response),
            Err(err) if attempt < TRANSPORT_ATTEMPTS => {
                let backoff = BACKOFF_BASE * (1 << (attempt - 1));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                debug!(attempt, error = %err, "transport error, backing off");
                tokio::time::sleep(backoff + jitter).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Seconds-form `retry-after` response header, if present.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Decodes base64url with or without padding.
pub(crate) fn b64url_decode(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
}

/// Shortens `s` to at most `max` bytes without splitting a code point.
pub(crate) fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One truncation step: shaves `overage` bytes off the field, emptying it to
/// `None` when nothing meaningful would remain. Returns whether the payload
/// changed, i.e. whether re-serializing is worthwhile.
pub(crate) fn shrink_string(field: &mut Option<String>, overage: usize) -> bool {
    match field {
        Some(s) if !s.is_empty() => {
            let target = s.len().saturating_sub(overage.max(1));
            if target == 0 {
                *field = None;
            } else {
                *s = truncate_str(s, target).to_owned();
            }
            true
        }
        Some(_) => {
            *field = None;
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 3), "hel");
        assert_eq!(truncate_str("hello", 10), "hello");
        // Multi-byte: é is two bytes, so a cut inside it moves left.
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("héllo", 3), "hé");
    }

    #[test]
    fn shrink_string_empties_when_overage_dominates() {
        let mut field = Some("short".to_owned());
        assert!(shrink_string(&mut field, 100));
        assert_eq!(field, None);

        let mut field = Some("a longer field value".to_owned());
        assert!(shrink_string(&mut field, 6));
        assert_eq!(field.as_deref(), Some("a longer field"));

        let mut none = None;
        assert!(!shrink_string(&mut none, 5));
    }

    #[test]
    fn degraded_window_expires() {
        let degraded = Degraded::default();
        assert!(!degraded.active());
        degraded.trip();
        assert!(degraded.active());
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn b64url_decode_tolerates_padding() {
        let bytes = [1u8; 32];
        use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
        use base64::Engine;

        let padded = URL_SAFE.encode(bytes);
        let unpadded = URL_SAFE_NO_PAD.encode(bytes);
        assert_eq!(b64url_decode(&padded).unwrap(), bytes);
        assert_eq!(b64url_decode(&unpadded).unwrap(), bytes);
    }
}
