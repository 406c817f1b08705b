use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;
use wildmatch::WildMatch;

use super::vapid::VapidSigner;
use super::{
    b64url_decode, retry_after, send_with_retries, shrink_string, Degraded, Outcome, Pushkin,
};
use crate::config::WebPushAppConfig;
use crate::error::Result;
use crate::http_client::{ClientFactory, ClientOptions};
use crate::notification::{Device, Notification, Priority};

/// Plaintext ceiling before encryption; the wire payload additionally
/// carries the RFC 8188 header block and AEAD tag.
pub const PAYLOAD_SIZE_LIMIT: usize = 4096;

/// Pushkin for RFC 8030 WebPush endpoints with VAPID authorization and
/// RFC 8188 `aes128gcm` payload encryption.
pub struct WebPushPushkin {
    name: String,
    client: ClientWithMiddleware,
    vapid: VapidSigner,
    ttl: u32,
    allowed_endpoints: Option<Vec<WildMatch>>,
    /// Latest generation per (pushkey, room); an entry newer than ours means
    /// a fresher notification superseded this dispatch.
    coalesce: Mutex<HashMap<(String, String), u64>>,
    generation: AtomicU64,
    degraded: Arc<Degraded>,
}

impl WebPushPushkin {
    pub fn new(
        name: &str,
        config: &WebPushAppConfig,
        factory: &ClientFactory,
        degraded: Arc<Degraded>,
    ) -> Result<Self> {
        let client = factory.build(ClientOptions {
            proxy: config.proxy.clone(),
            max_connections: config.max_connections,
            identity: None,
        })?;

        let vapid = VapidSigner::new(&config.vapid_private_key, &config.vapid_contact_email)?;

        let allowed_endpoints = config
            .allowed_endpoints
            .as_ref()
            .map(|globs| globs.iter().map(|glob| WildMatch::new(glob)).collect());

        Ok(Self {
            name: name.to_owned(),
            client,
            vapid,
            ttl: config.ttl,
            allowed_endpoints,
            coalesce: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            degraded,
        })
    }

    fn endpoint_allowed(&self, endpoint: &Url) -> bool {
        let Some(globs) = &self.allowed_endpoints else {
            return true;
        };
        let Some(host) = endpoint.host_str() else {
            return false;
        };
        globs.iter().any(|glob| glob.matches(host))
    }

    /// Registers this dispatch as the latest for its (pushkey, room) slot
    /// and returns the generation to compare against before sending.
    fn enter_coalesce_slot(&self, device: &Device, room_id: &str) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slots = self.coalesce.lock().unwrap();
        slots.insert((device.pushkey.clone(), room_id.to_owned()), generation);
        generation
    }

    /// True when a newer notification claimed the slot while we were queued.
    fn superseded(&self, device: &Device, room_id: &str, generation: u64) -> bool {
        let slots = self.coalesce.lock().unwrap();
        slots
            .get(&(device.pushkey.clone(), room_id.to_owned()))
            .is_some_and(|latest| *latest != generation)
    }

    fn leave_coalesce_slot(&self, device: &Device, room_id: &str, generation: u64) {
        let mut slots = self.coalesce.lock().unwrap();
        let key = (device.pushkey.clone(), room_id.to_owned());
        if slots.get(&key) == Some(&generation) {
            slots.remove(&key);
        }
    }

    fn shape_body(
        &self,
        notification: &Notification,
        device: &Device,
        drop_body: bool,
    ) -> std::result::Result<Vec<u8>, Outcome> {
        let mut state = BodyState::new(notification);
        if drop_body {
            state.body = None;
        }
        loop {
            let payload = build_payload(notification, device, &state);
            let bytes = serde_json::to_vec(&Value::Object(payload))
                .map_err(|_| Outcome::retryable("payload serialization failed"))?;
            if bytes.len() <= PAYLOAD_SIZE_LIMIT {
                return Ok(bytes);
            }
            if !state.shrink(bytes.len() - PAYLOAD_SIZE_LIMIT) {
                return Err(Outcome::retryable("payload too large after truncation"));
            }
        }
    }

    async fn dispatch_one(&self, notification: &Notification, device: &Device) -> Outcome {
        let data = device.data.as_ref();

        let Some(endpoint) = data.and_then(|d| d.endpoint.as_deref()) else {
            return Outcome::rejected("no endpoint in device data");
        };
        let Ok(endpoint) = Url::parse(endpoint) else {
            return Outcome::rejected("invalid endpoint URL");
        };
        let Some(auth) = data.and_then(|d| d.auth.as_deref()) else {
            return Outcome::rejected("no auth secret in device data");
        };

        if !self.endpoint_allowed(&endpoint) {
            warn!(
                pushkin = %self.name,
                endpoint = %endpoint,
                "endpoint host does not match allowed_endpoints"
            );
            return Outcome::rejected("endpoint not allowed");
        }

        if data.is_some_and(|d| d.events_only) && notification.event_id.is_none() {
            debug!(pushkin = %self.name, "suppressing event-less poke for events_only device");
            return Outcome::Delivered;
        }

        let p256dh = match b64url_decode(&device.pushkey) {
            Ok(raw) => raw,
            Err(_) => return Outcome::rejected("pushkey is not a valid p256dh key"),
        };
        let auth_secret = match b64url_decode(auth) {
            Ok(raw) => raw,
            Err(_) => return Outcome::rejected("auth secret is not valid base64url"),
        };

        let authorization = match self.vapid.authorization(&endpoint) {
            Ok(header) => header,
            Err(err) => {
                warn!(pushkin = %self.name, error = %err, "VAPID header mint failed");
                return Outcome::retryable("VAPID header mint failed");
            }
        };

        let coalesce_slot = notification.room_id.as_deref().and_then(|room_id| {
            let flagged = data.is_some_and(|d| d.only_last_per_room);
            flagged.then(|| (room_id, self.enter_coalesce_slot(device, room_id)))
        });

        let mut outcome = self
            .send(
                notification,
                device,
                &endpoint,
                &p256dh,
                &auth_secret,
                authorization.as_str(),
                false,
                coalesce_slot,
            )
            .await;

        // One shot at a slimmer payload when the push service balks at the
        // size.
        if matches!(&outcome, Outcome::Retryable { reason, .. } if reason == "payload too large") {
            outcome = self
                .send(
                    notification,
                    device,
                    &endpoint,
                    &p256dh,
                    &auth_secret,
                    authorization.as_str(),
                    true,
                    None,
                )
                .await;
            if matches!(&outcome, Outcome::Retryable { reason, .. } if reason == "payload too large")
            {
                outcome = Outcome::rejected("payload too large");
            }
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        notification: &Notification,
        device: &Device,
        endpoint: &Url,
        p256dh: &[u8],
        auth_secret: &[u8],
        authorization: &str,
        drop_body: bool,
        coalesce_slot: Option<(&str, u64)>,
    ) -> Outcome {
        let plaintext = match self.shape_body(notification, device, drop_body) {
            Ok(body) => body,
            Err(outcome) => return outcome,
        };

        let ciphertext = match ece::encrypt(p256dh, auth_secret, &plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(err) => {
                debug!(pushkin = %self.name, error = %err, "payload encryption failed");
                return Outcome::rejected("subscription keys are unusable");
            }
        };

        if let Some((room_id, generation)) = coalesce_slot {
            if self.superseded(device, room_id, generation) {
                debug!(pushkin = %self.name, room_id, "dropping superseded per-room notification");
                return Outcome::Delivered;
            }
        }

        let ttl = device
            .data
            .as_ref()
            .and_then(|d| d.ttl)
            .unwrap_or(self.ttl);
        let urgency = match notification.priority() {
            Priority::High => "high",
            Priority::Low => "normal",
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert("content-encoding", HeaderValue::from_static("aes128gcm"));
        headers.insert("urgency", HeaderValue::from_static(urgency));
        if let Ok(value) = HeaderValue::from_str(&ttl.to_string()) {
            headers.insert("ttl", value);
        }
        if let Some(topic) = device.tweak_topic() {
            if let Ok(value) = HeaderValue::from_str(topic) {
                headers.insert("topic", value);
            }
        }
        match HeaderValue::from_str(authorization) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => return Outcome::retryable("VAPID header is not a valid header value"),
        }

        let response = send_with_retries(|| {
            let request = self
                .client
                .post(endpoint.clone())
                .headers(headers.clone())
                .body(ciphertext.clone());
            async move { request.send().await }
        })
        .await;

        if let Some((room_id, generation)) = coalesce_slot {
            self.leave_coalesce_slot(device, room_id, generation);
        }

        let response = match response {
            Ok(response) => response,
            Err(err) => return Outcome::retryable(format!("transport error: {err}")),
        };

        let status = response.status();
        let retry = retry_after(response.headers());
        match status.as_u16() {
            200..=299 => Outcome::Delivered,
            404 | 410 => Outcome::rejected("subscription expired"),
            413 => Outcome::retryable("payload too large"),
            401 | 403 => {
                warn!(pushkin = %self.name, %status, "push service rejected our authorization");
                self.degraded.trip();
                Outcome::retryable("authorization rejected")
            }
            429 => Outcome::retryable_after("upstream rate limited", retry),
            400..=499 => Outcome::rejected(format!("upstream rejected the request: {status}")),
            _ => Outcome::retryable_after(format!("upstream error: {status}"), retry),
        }
    }
}

#[async_trait]
impl Pushkin for WebPushPushkin {
    fn kind(&self) -> &'static str {
        "webpush"
    }

    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(devices.len());
        for device in devices {
            outcomes.push(self.dispatch_one(notification, device).await);
        }
        outcomes
    }
}

/// Alert inputs under the shrinker's control; same order as the other
/// pushkins.
struct BodyState {
    body: Option<String>,
    room_name: Option<String>,
    sender_display: Option<String>,
    room_alias: Option<String>,
    include_content: bool,
}

impl BodyState {
    fn new(notification: &Notification) -> Self {
        Self {
            body: notification.content_body().map(str::to_owned),
            room_name: notification.room_name.clone(),
            sender_display: notification.sender_display_name.clone(),
            room_alias: notification.room_alias.clone(),
            include_content: notification.content.is_some(),
        }
    }

    fn shrink(&mut self, overage: usize) -> bool {
        if shrink_string(&mut self.body, overage)
            || shrink_string(&mut self.room_name, overage)
            || shrink_string(&mut self.sender_display, overage)
            || shrink_string(&mut self.room_alias, overage)
        {
            return true;
        }
        if self.include_content {
            self.include_content = false;
            return true;
        }
        false
    }
}

/// The cleartext notification JSON, nested rather than string-flattened.
fn build_payload(
    notification: &Notification,
    device: &Device,
    state: &BodyState,
) -> Map<String, Value> {
    let mut payload: Map<String, Value> = device.default_payload().cloned().unwrap_or_default();

    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            payload.insert(key.to_owned(), value);
        }
    };

    set("event_id", notification.event_id.as_deref().map(Value::from));
    set("room_id", notification.room_id.as_deref().map(Value::from));
    set("type", notification.event_type.as_deref().map(Value::from));
    set("sender", notification.sender.as_deref().map(Value::from));
    set(
        "sender_display_name",
        state.sender_display.as_deref().map(Value::from),
    );
    set("room_name", state.room_name.as_deref().map(Value::from));
    set("room_alias", state.room_alias.as_deref().map(Value::from));
    set("prio", Some(notification.priority().as_str().into()));
    set(
        "membership",
        notification.membership.as_deref().map(Value::from),
    );
    set("unread", notification.unread.map(Value::from));
    set("missed_calls", notification.missed_calls.map(Value::from));

    if state.include_content {
        if let Some(content) = &notification.content {
            let mut content = content.clone();
            match &state.body {
                Some(body) => {
                    if content.contains_key("body") {
                        content.insert("body".to_owned(), body.as_str().into());
                    }
                }
                None => {
                    content.remove("body");
                }
            }
            payload.insert("content".to_owned(), Value::Object(content));
        }
    }

    payload
}

#[cfg(test)]
mod test {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::json;

    use super::*;

    fn test_pushkin(allowed: Option<&[&str]>) -> WebPushPushkin {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();

        let allowed_yaml = match allowed {
            Some(globs) => format!("allowed_endpoints: {:?}\n", globs),
            None => String::new(),
        };
        let yaml = format!(
            "type: webpush\nvapid_contact_email: ops@example.com\n{allowed_yaml}vapid_private_key: |\n{}",
            pem.as_str()
                .lines()
                .map(|line| format!("  {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        let crate::config::AppConfig::WebPush(config) =
            serde_yaml::from_str::<crate::config::AppConfig>(&yaml).unwrap()
        else {
            unreachable!()
        };
        WebPushPushkin::new(
            "com.example.myapp.web",
            &config,
            &ClientFactory::new(None),
            Arc::new(Degraded::default()),
        )
        .unwrap()
    }

    fn subscription_device(endpoint: &str) -> Device {
        let (keypair, auth) = ece::generate_keypair_and_auth_secret().unwrap();
        let p256dh = URL_SAFE_NO_PAD.encode(keypair.pub_as_raw().unwrap());
        serde_json::from_value(json!({
            "app_id": "com.example.myapp.web",
            "pushkey": p256dh,
            "data": {
                "endpoint": endpoint,
                "auth": URL_SAFE_NO_PAD.encode(auth),
            },
        }))
        .unwrap()
    }

    fn notification() -> Notification {
        serde_json::from_value::<Notification>(json!({
            "event_id": "$ev:example.com",
            "room_id": "!room:example.com",
            "type": "m.room.message",
            "sender": "@alice:example.com",
            "content": {"msgtype": "m.text", "body": "hello"},
            "counts": {"unread": 1},
        }))
        .unwrap()
        .normalize()
    }

    #[tokio::test]
    async fn disallowed_endpoint_is_rejected_without_a_network_call() {
        let pushkin = test_pushkin(Some(&["updates.push.services.mozilla.com"]));
        let device = subscription_device("https://evil.example/sub/xyz");

        let outcomes = pushkin.dispatch(&notification(), &[device]).await;
        assert_eq!(outcomes[0], Outcome::rejected("endpoint not allowed"));
    }

    #[test]
    fn endpoint_globs_match_hosts() {
        let pushkin = test_pushkin(Some(&["*.notify.windows.com", "push.example.com"]));
        assert!(pushkin
            .endpoint_allowed(&Url::parse("https://sin.notify.windows.com/w/abc").unwrap()));
        assert!(pushkin.endpoint_allowed(&Url::parse("https://push.example.com/x").unwrap()));
        assert!(!pushkin.endpoint_allowed(&Url::parse("https://push.example.com.evil/x").unwrap()));
    }

    #[tokio::test]
    async fn events_only_devices_skip_event_less_pokes() {
        let pushkin = test_pushkin(None);
        let mut device = subscription_device("https://push.example.com/sub/1");
        device.data.as_mut().unwrap().events_only = true;

        let mut poke = notification();
        poke.event_id = None;

        let outcomes = pushkin.dispatch(&poke, &[device]).await;
        assert_eq!(outcomes[0], Outcome::Delivered);
    }

    #[test]
    fn payload_encrypts_and_decrypts_round_trip() {
        let (keypair, auth) = ece::generate_keypair_and_auth_secret().unwrap();
        let message = json!({"room_id": "!room:example.com", "body": "x".repeat(3000)});
        let plaintext = serde_json::to_vec(&message).unwrap();

        let ciphertext = ece::encrypt(
            &keypair.pub_as_raw().unwrap(),
            &auth,
            &plaintext,
        )
        .unwrap();
        assert_ne!(ciphertext, plaintext);

        let decrypted =
            ece::decrypt(&keypair.raw_components().unwrap(), &auth, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn coalesce_slot_tracks_the_latest_generation() {
        let pushkin = test_pushkin(None);
        let device = subscription_device("https://push.example.com/sub/1");

        let first = pushkin.enter_coalesce_slot(&device, "!room:example.com");
        let second = pushkin.enter_coalesce_slot(&device, "!room:example.com");

        assert!(pushkin.superseded(&device, "!room:example.com", first));
        assert!(!pushkin.superseded(&device, "!room:example.com", second));

        // Leaving with a stale generation must not evict the newer entry.
        pushkin.leave_coalesce_slot(&device, "!room:example.com", first);
        assert!(pushkin.superseded(&device, "!room:example.com", first));
        pushkin.leave_coalesce_slot(&device, "!room:example.com", second);
        assert!(!pushkin.superseded(&device, "!room:example.com", second));
    }

    #[test]
    fn shaped_body_stays_under_the_plaintext_cap() {
        let pushkin = test_pushkin(None);
        let device = subscription_device("https://push.example.com/sub/1");
        let mut n = notification();
        n.content
            .as_mut()
            .unwrap()
            .insert("body".to_owned(), json!("z".repeat(50_000)));

        let body = pushkin.shape_body(&n, &device, false).unwrap();
        assert!(body.len() <= PAYLOAD_SIZE_LIMIT);

        let slim = pushkin.shape_body(&n, &device, true).unwrap();
        let parsed: Value = serde_json::from_slice(&slim).unwrap();
        assert!(parsed["content"].get("body").is_none());
    }
}
