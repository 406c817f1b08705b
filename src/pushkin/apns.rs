use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::token::TokenFactory;
use super::{
    b64url_decode, retry_after, send_with_retries, shrink_string, Degraded, Outcome, Pushkin,
};
use crate::config::ApnsAppConfig;
use crate::error::{Error, Result};
use crate::http_client::{ClientFactory, ClientOptions};
use crate::metrics::Metrics;
use crate::notification::{Device, Notification, Priority, FORMAT_EVENT_ID_ONLY};

/// Payload ceiling for the APNs provider API.
pub const PAYLOAD_SIZE_LIMIT: usize = 4096;

/// Warn at startup when the provider certificate expires within this window.
const CERTIFICATE_EXPIRY_WARNING: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// `reason` strings that mean the device token itself is dead.
const DEFAULT_REJECT_REASONS: &[&str] = &[
    "BadDeviceToken",
    "DeviceTokenNotForTopic",
    "Unregistered",
    "BadTopic",
    "TopicDisallowed",
    "MissingDeviceToken",
];

/// `reason` strings that mean APNs wants the request again later.
const DEFAULT_RETRY_REASONS: &[&str] = &[
    "TooManyRequests",
    "InternalServerError",
    "ServiceUnavailable",
    "Shutdown",
];

/// `reason` strings that mean our own credentials were refused.
const PROVIDER_TOKEN_REASONS: &[&str] = &[
    "InvalidProviderToken",
    "ExpiredProviderToken",
    "MissingProviderToken",
];

static PRODUCTION_SERVER: Lazy<Url> =
    Lazy::new(|| Url::parse("https://api.push.apple.com/3/device/").unwrap());

static SANDBOX_SERVER: Lazy<Url> =
    Lazy::new(|| Url::parse("https://api.sandbox.push.apple.com/3/device/").unwrap());

/// APNs endpoint, selected by the `platform` option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Production,
    Sandbox,
    Custom(Url),
}

impl Endpoint {
    fn base_url(&self) -> Result<Url> {
        match self {
            Self::Production => Ok(PRODUCTION_SERVER.clone()),
            Self::Sandbox => Ok(SANDBOX_SERVER.clone()),
            Self::Custom(url) => Ok(url.join("/3/device/")?),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Production
    }
}

impl FromStr for Endpoint {
    type Err = url::ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("prod") || s.eq_ignore_ascii_case("production") {
            Ok(Self::Production)
        } else if s.eq_ignore_ascii_case("sandbox") || s.eq_ignore_ascii_case("dev") {
            Ok(Self::Sandbox)
        } else {
            Url::parse(s).map(Self::Custom)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: Option<String>,
}

/// Pushkin for the Apple Push Notification service provider API.
pub struct ApnsPushkin {
    name: String,
    client: ClientWithMiddleware,
    base_url: Url,
    topic: Option<String>,
    push_type: Option<HeaderValue>,
    convert_device_token_to_hex: bool,
    token_factory: Option<TokenFactory>,
    reject_reasons: HashSet<String>,
    retry_reasons: HashSet<String>,
    degraded: Arc<Degraded>,
}

impl ApnsPushkin {
    pub fn new(
        name: &str,
        config: &ApnsAppConfig,
        factory: &ClientFactory,
        metrics: &Arc<Metrics>,
        degraded: Arc<Degraded>,
    ) -> Result<Self> {
        let endpoint = match config.platform.as_deref() {
            Some(platform) => Endpoint::from_str(platform)
                .map_err(|err| Error::Config(format!("app {name:?}: bad platform: {err}")))?,
            None => Endpoint::default(),
        };

        let mut topic = config.topic.clone();
        let mut identity = None;

        if let Some(certfile) = &config.certfile {
            let pem = std::fs::read(certfile)?;
            identity = Some(reqwest::Identity::from_pem(&pem)?);

            let (cert_topic, not_after) = inspect_certificate(&pem)?;
            if topic.is_none() {
                topic = cert_topic;
            }
            if topic.is_none() {
                return Err(Error::Credentials(format!(
                    "app {name:?}: no topic configured and none found in the certificate subject"
                )));
            }
            if let Some(not_after) = not_after {
                metrics
                    .apns_certificate_expiry
                    .with_label_values(&[name])
                    .set(not_after);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                if not_after < now + CERTIFICATE_EXPIRY_WARNING.as_secs() as i64 {
                    warn!(
                        pushkin = %name,
                        expires_at = not_after,
                        "APNs certificate expires within 30 days"
                    );
                }
            }
        }

        let token_factory = match &config.keyfile {
            Some(keyfile) => {
                let key_pem = std::fs::read(keyfile)?;
                // key_id and team_id presence is checked at config load.
                let key_id = config.key_id.as_deref().unwrap_or_default();
                let team_id = config.team_id.as_deref().unwrap_or_default();
                Some(TokenFactory::new(key_id, &key_pem, team_id)?)
            }
            None => None,
        };

        let push_type = match &config.push_type {
            Some(push_type) => Some(HeaderValue::from_str(push_type)?),
            None => None,
        };

        let client = factory.build(ClientOptions {
            proxy: config.proxy.clone(),
            max_connections: config.max_connections,
            identity,
        })?;

        Ok(Self {
            name: name.to_owned(),
            client,
            base_url: endpoint.base_url()?,
            topic,
            push_type,
            convert_device_token_to_hex: config.convert_device_token_to_hex,
            token_factory,
            reject_reasons: as_set(config.reject_reasons.as_deref(), DEFAULT_REJECT_REASONS),
            retry_reasons: as_set(config.retry_reasons.as_deref(), DEFAULT_RETRY_REASONS),
            degraded,
        })
    }

    /// The token used as the request path segment.
    fn device_path_token(&self, device: &Device) -> std::result::Result<String, Outcome> {
        if device.pushkey.contains(':') {
            warn!(
                pushkin = %self.name,
                app_id = %device.app_id,
                "pushkey looks like an FCM registration token; the app is \
                 probably configured with the wrong pushkin type"
            );
            return Err(Outcome::rejected("pushkey is not an APNs device token"));
        }

        if !self.convert_device_token_to_hex {
            return Ok(device.pushkey.clone());
        }

        match b64url_decode(&device.pushkey) {
            Ok(raw) => Ok(hex::encode(raw)),
            Err(err) => {
                debug!(pushkin = %self.name, error = %err, "pushkey is not valid base64url");
                Err(Outcome::rejected("pushkey is not valid base64url"))
            }
        }
    }

    fn shape_payload(
        &self,
        notification: &Notification,
        device: &Device,
    ) -> std::result::Result<Vec<u8>, Outcome> {
        if device.effective_format(notification) == Some(FORMAT_EVENT_ID_ONLY) {
            let payload = event_id_only_payload(notification, device);
            let bytes = serialize(&payload)?;
            if bytes.len() > PAYLOAD_SIZE_LIMIT {
                return Err(Outcome::retryable("payload too large"));
            }
            return Ok(bytes);
        }

        let mut state = AlertState::new(notification);
        loop {
            let payload = full_payload(notification, device, &state);
            let bytes = serialize(&payload)?;
            if bytes.len() <= PAYLOAD_SIZE_LIMIT {
                return Ok(bytes);
            }
            let overage = bytes.len() - PAYLOAD_SIZE_LIMIT;
            if !state.shrink(overage) {
                return Err(Outcome::retryable("payload too large after truncation"));
            }
        }
    }

    async fn dispatch_one(&self, notification: &Notification, device: &Device) -> Outcome {
        let token = match self.device_path_token(device) {
            Ok(token) => token,
            Err(outcome) => return outcome,
        };
        let url = match self.base_url.join(&token) {
            Ok(url) => url,
            Err(_) => return Outcome::rejected("pushkey does not form a valid request path"),
        };
        let body = match self.shape_payload(notification, device) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(topic) = &self.topic {
            match HeaderValue::from_str(topic) {
                Ok(value) => {
                    headers.insert("apns-topic", value);
                }
                Err(_) => return Outcome::retryable("configured topic is not a valid header"),
            }
        }
        if let Some(push_type) = &self.push_type {
            headers.insert("apns-push-type", push_type.clone());
        }
        let priority = match notification.priority() {
            Priority::High => HeaderValue::from_static("10"),
            Priority::Low => HeaderValue::from_static("5"),
        };
        headers.insert("apns-priority", priority);

        let bearer = match &self.token_factory {
            Some(factory) => match factory.get() {
                Ok(jwt) => Some(jwt),
                Err(err) => {
                    warn!(pushkin = %self.name, error = %err, "provider token mint failed");
                    return Outcome::retryable("provider token mint failed");
                }
            },
            None => None,
        };

        let response = send_with_retries(|| {
            let mut request = self
                .client
                .post(url.clone())
                .headers(headers.clone())
                .body(body.clone());
            if let Some(jwt) = &bearer {
                request = request.bearer_auth(jwt);
            }
            async move { request.send().await }
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return Outcome::retryable(format!("transport error: {err}")),
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Delivered;
        }
        let retry = retry_after(response.headers());
        let reason = response
            .json::<ApnsErrorBody>()
            .await
            .ok()
            .and_then(|body| body.reason);
        self.map_response(status, reason, retry)
    }

    fn map_response(
        &self,
        status: StatusCode,
        reason: Option<String>,
        retry: Option<Duration>,
    ) -> Outcome {
        if let Some(reason) = &reason {
            if PROVIDER_TOKEN_REASONS.contains(&reason.as_str()) {
                warn!(pushkin = %self.name, reason = %reason, "APNs rejected our credentials");
                self.degraded.trip();
                return Outcome::retryable(format!("credentials rejected: {reason}"));
            }
            if self.reject_reasons.contains(reason) {
                return Outcome::rejected(reason.clone());
            }
            if self.retry_reasons.contains(reason) {
                return Outcome::retryable_after(reason.clone(), retry);
            }
        }

        let reason = reason.unwrap_or_else(|| status.to_string());
        match status.as_u16() {
            410 => Outcome::rejected(reason),
            429 | 500 | 503 => Outcome::retryable_after(reason, retry),
            // Telling the homeserver to drop the pusher beats spinning on a
            // request APNs will never accept.
            400..=499 => Outcome::rejected(reason),
            _ => Outcome::retryable_after(reason, retry),
        }
    }
}

#[async_trait]
impl Pushkin for ApnsPushkin {
    fn kind(&self) -> &'static str {
        "apns"
    }

    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(devices.len());
        for device in devices {
            outcomes.push(self.dispatch_one(notification, device).await);
        }
        outcomes
    }
}

fn as_set(configured: Option<&[String]>, default: &[&str]) -> HashSet<String> {
    match configured {
        Some(reasons) => reasons.iter().cloned().collect(),
        None => default.iter().map(|s| (*s).to_owned()).collect(),
    }
}

fn serialize(payload: &Map<String, Value>) -> std::result::Result<Vec<u8>, Outcome> {
    serde_json::to_vec(payload).map_err(|_| Outcome::retryable("payload serialization failed"))
}

fn aps_of(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .get("aps")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn event_id_only_payload(notification: &Notification, device: &Device) -> Map<String, Value> {
    let mut payload = device.default_payload().cloned().unwrap_or_default();
    let mut aps = aps_of(&payload);
    if let Some(unread) = notification.unread {
        aps.insert("badge".to_owned(), unread.into());
    }
    aps.insert("content-available".to_owned(), 1.into());
    if let Some(room_id) = &notification.room_id {
        payload.insert("room_id".to_owned(), room_id.as_str().into());
    }
    if let Some(event_id) = &notification.event_id {
        payload.insert("event_id".to_owned(), event_id.as_str().into());
    }
    payload.insert("aps".to_owned(), Value::Object(aps));
    payload
}

/// The mutable inputs of the alert, shaved field by field while the payload
/// is over the size ceiling: content body first, then room name, sender
/// display name, room alias.
struct AlertState {
    body: Option<String>,
    room_name: Option<String>,
    sender_display: Option<String>,
    room_alias: Option<String>,
}

impl AlertState {
    fn new(notification: &Notification) -> Self {
        Self {
            body: notification.content_body().map(str::to_owned),
            room_name: notification.room_name.clone(),
            sender_display: notification.sender_display().map(str::to_owned),
            room_alias: notification.room_alias.clone(),
        }
    }

    fn shrink(&mut self, overage: usize) -> bool {
        shrink_string(&mut self.body, overage)
            || shrink_string(&mut self.room_name, overage)
            || shrink_string(&mut self.sender_display, overage)
            || shrink_string(&mut self.room_alias, overage)
    }
}

fn full_payload(
    notification: &Notification,
    device: &Device,
    state: &AlertState,
) -> Map<String, Value> {
    let mut payload = device.default_payload().cloned().unwrap_or_default();
    let mut aps = aps_of(&payload);

    if let Some((loc_key, loc_args)) = alert_content(notification, state) {
        aps.insert(
            "alert".to_owned(),
            json!({ "loc-key": loc_key, "loc-args": loc_args }),
        );
        aps.insert(
            "sound".to_owned(),
            device.tweak_sound().unwrap_or("default").into(),
        );
    }
    if let Some(unread) = notification.unread {
        aps.insert("badge".to_owned(), unread.into());
    }

    if let Some(room_id) = &notification.room_id {
        payload.insert("room_id".to_owned(), room_id.as_str().into());
    }
    if let Some(event_id) = &notification.event_id {
        payload.insert("event_id".to_owned(), event_id.as_str().into());
    }
    payload.insert("aps".to_owned(), Value::Object(aps));
    payload
}

/// Localization key and arguments for the visible alert.
fn alert_content(notification: &Notification, state: &AlertState) -> Option<(&'static str, Vec<String>)> {
    let from = state.sender_display.clone().unwrap_or_default();
    let room = state
        .room_name
        .as_deref()
        .or(state.room_alias.as_deref())
        .map(str::to_owned);

    match notification.event_type.as_deref() {
        Some("m.room.member")
            if notification.user_is_target
                && notification.membership.as_deref() == Some("invite") =>
        {
            Some(match room {
                Some(room) => ("USER_INVITE_TO_NAMED_ROOM", vec![from, room]),
                None => ("USER_INVITE_TO_CHAT", vec![from]),
            })
        }
        Some("m.room.message") | Some("m.room.encrypted") => {
            let body = state.body.clone();
            Some(match (room, body) {
                (Some(room), Some(body)) => match notification.msgtype() {
                    Some("m.emote") => ("ACTION_FROM_USER_IN_ROOM", vec![room, from, body]),
                    Some("m.image") => ("IMAGE_FROM_USER_IN_ROOM", vec![from, body, room]),
                    _ => ("MSG_FROM_USER_IN_ROOM", vec![from, body, room]),
                },
                (Some(room), None) => ("MSG_IN_ROOM", vec![from, room]),
                (None, Some(body)) => match notification.msgtype() {
                    Some("m.emote") => ("ACTION_FROM_USER", vec![from, body]),
                    Some("m.image") => ("IMAGE_FROM_USER", vec![from, body]),
                    _ => ("MSG_FROM_USER", vec![from, body]),
                },
                (None, None) => ("MSG", vec![from]),
            })
        }
        Some("m.call.invite") => Some(("VOICE_CALL_FROM_USER", vec![from])),
        _ => None,
    }
}

/// Pulls the topic and expiry out of the first certificate in the PEM.
///
/// Provider certificates carry a subject CN like
/// `Apple Push Services: com.example.app`; the topic is the suffix.
fn inspect_certificate(pem: &[u8]) -> Result<(Option<String>, Option<i64>)> {
    for block in x509_parser::pem::Pem::iter_from_buffer(pem) {
        let block =
            block.map_err(|err| Error::Credentials(format!("bad certificate PEM: {err}")))?;
        if block.label != "CERTIFICATE" {
            continue;
        }
        let cert = block
            .parse_x509()
            .map_err(|err| Error::Credentials(format!("bad certificate: {err}")))?;

        let topic = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|cn| cn.rsplit(": ").next().unwrap_or(cn).to_owned());
        let not_after = cert.validity().not_after.timestamp();
        return Ok((topic, Some(not_after)));
    }
    Ok((None, None))
}

#[cfg(test)]
mod test {
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::json;

    use super::*;
    use crate::notification::DeviceData;

    fn test_pushkin(convert: bool) -> ApnsPushkin {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let keyfile = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(keyfile.path(), pem.as_bytes()).unwrap();

        let yaml = format!(
            r#"
type: apns
keyfile: {keyfile}
key_id: KEYID12345
team_id: TEAMID1234
topic: com.example.myapp
platform: "http://127.0.0.1:9"
convert_device_token_to_hex: {convert}
"#,
            keyfile = keyfile.path().display(),
        );
        let crate::config::AppConfig::Apns(config) =
            serde_yaml::from_str::<crate::config::AppConfig>(&yaml).unwrap()
        else {
            unreachable!()
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        ApnsPushkin::new(
            "com.example.myapp.ios",
            &config,
            &ClientFactory::new(None),
            &metrics,
            Arc::new(Degraded::default()),
        )
        .unwrap()
    }

    fn notification(body: &str) -> Notification {
        serde_json::from_value::<Notification>(json!({
            "event_id": "$ev:example.com",
            "room_id": "!room:example.com",
            "type": "m.room.message",
            "sender": "@alice:example.com",
            "sender_display_name": "Alice",
            "room_name": "Tea Party",
            "content": {"msgtype": "m.text", "body": body},
            "counts": {"unread": 2},
            "devices": [],
        }))
        .unwrap()
        .normalize()
    }

    fn device() -> Device {
        Device {
            app_id: "com.example.myapp.ios".to_owned(),
            pushkey: "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fcm_shaped_pushkey_is_rejected_without_a_network_call() {
        let pushkin = test_pushkin(true);
        let device = Device {
            pushkey: "APA91bHun4MxP5egoKMwt2KZFBaFUH-1RYqx:APA91bE".to_owned(),
            ..device()
        };
        let outcomes = pushkin.dispatch(&notification("hi"), &[device]).await;
        assert!(matches!(outcomes[0], Outcome::Rejected { .. }));
    }

    #[test]
    fn pushkey_is_hex_encoded_for_the_path() {
        let pushkin = test_pushkin(true);
        let token = pushkin.device_path_token(&device()).unwrap();
        assert_eq!(token, "01".repeat(32));

        let raw = test_pushkin(false);
        let token = raw.device_path_token(&device()).unwrap();
        assert_eq!(token, device().pushkey);
    }

    #[test]
    fn alert_uses_the_invite_keys() {
        let notification = serde_json::from_value::<Notification>(json!({
            "type": "m.room.member",
            "membership": "invite",
            "user_is_target": true,
            "sender_display_name": "Alice",
            "room_name": "Tea Party",
        }))
        .unwrap()
        .normalize();

        let state = AlertState::new(&notification);
        let (key, args) = alert_content(&notification, &state).unwrap();
        assert_eq!(key, "USER_INVITE_TO_NAMED_ROOM");
        assert_eq!(args, ["Alice", "Tea Party"]);
    }

    #[test]
    fn payload_fits_after_truncation() {
        let pushkin = test_pushkin(true);
        let huge = "x".repeat(20_000);
        let bytes = pushkin
            .shape_payload(&notification(&huge), &device())
            .unwrap();
        assert!(bytes.len() <= PAYLOAD_SIZE_LIMIT);

        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        let args = payload["aps"]["alert"]["loc-args"].as_array().unwrap();
        // Truncation shortens the body argument but keeps the rest.
        assert!(args[1].as_str().unwrap().len() < huge.len());
    }

    #[test]
    fn event_id_only_payload_keeps_identifiers_only() {
        let pushkin = test_pushkin(true);
        let mut device = device();
        device.data = Some(DeviceData {
            format: Some(FORMAT_EVENT_ID_ONLY.to_owned()),
            ..Default::default()
        });

        let bytes = pushkin.shape_payload(&notification("hello"), &device).unwrap();
        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        let keys: Vec<_> = payload.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["aps", "event_id", "room_id"]);
        assert_eq!(payload["aps"]["badge"], 2);
        assert!(payload["aps"].get("alert").is_none());
    }

    #[test]
    fn response_mapping_follows_the_status_and_reason() {
        let pushkin = test_pushkin(true);

        assert!(matches!(
            pushkin.map_response(StatusCode::GONE, Some("Unregistered".into()), None),
            Outcome::Rejected { .. }
        ));
        assert!(matches!(
            pushkin.map_response(StatusCode::BAD_REQUEST, Some("BadDeviceToken".into()), None),
            Outcome::Rejected { .. }
        ));
        assert!(matches!(
            pushkin.map_response(StatusCode::SERVICE_UNAVAILABLE, None, None),
            Outcome::Retryable { .. }
        ));
        assert!(matches!(
            pushkin.map_response(StatusCode::PAYMENT_REQUIRED, None, None),
            Outcome::Rejected { .. }
        ));

        assert!(!pushkin.degraded.active());
        assert!(matches!(
            pushkin.map_response(
                StatusCode::FORBIDDEN,
                Some("InvalidProviderToken".into()),
                None
            ),
            Outcome::Retryable { .. }
        ));
        assert!(pushkin.degraded.active());
    }
}
