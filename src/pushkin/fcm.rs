use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

use super::oauth::{AccessTokenManager, ServiceAccount};
use super::{retry_after, send_with_retries, shrink_string, Degraded, Outcome, Pushkin};
use crate::config::FcmAppConfig;
use crate::error::{Error, Result};
use crate::http_client::{ClientFactory, ClientOptions};
use crate::notification::{Device, Notification};

const LEGACY_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";
const V1_BASE: &str = "https://fcm.googleapis.com";

/// The legacy API takes up to this many registration ids per call.
pub const MAX_REGISTRATION_IDS: usize = 1000;

/// Ceiling on the serialized `data` object of one message.
pub const PAYLOAD_SIZE_LIMIT: usize = 4096;

const LEGACY_REJECT_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MismatchSenderId"];
const LEGACY_RETRY_ERRORS: &[&str] = &["Unavailable", "InternalServerError"];

enum Mode {
    Legacy { auth: HeaderValue, url: Url },
    V1 { tokens: AccessTokenManager, url: Url },
}

/// Pushkin for Firebase Cloud Messaging, legacy or v1 flavour.
pub struct FcmPushkin {
    name: String,
    client: ClientWithMiddleware,
    mode: Mode,
    options: Map<String, Value>,
    degraded: Arc<Degraded>,
}

impl FcmPushkin {
    pub fn new(
        name: &str,
        config: &FcmAppConfig,
        factory: &ClientFactory,
        degraded: Arc<Degraded>,
    ) -> Result<Self> {
        let client = factory.build(ClientOptions {
            proxy: config.proxy.clone(),
            max_connections: config.max_connections,
            identity: None,
        })?;

        let mode = if config.api_version.as_deref() == Some("v1") {
            // Presence of both fields is checked at config load.
            let account_path = config.service_account_file.as_deref().unwrap();
            let project_id = config.project_id.as_deref().unwrap();
            let account = ServiceAccount::load(account_path)?;
            let base = config.endpoint.as_deref().unwrap_or(V1_BASE);
            let url = Url::parse(&format!(
                "{}/v1/projects/{}/messages:send",
                base.trim_end_matches('/'),
                project_id
            ))?;
            Mode::V1 {
                tokens: AccessTokenManager::new(account, client.clone())?,
                url,
            }
        } else {
            let api_key = config.api_key.as_deref().unwrap();
            let auth = HeaderValue::from_str(&format!("key={api_key}"))
                .map_err(|_| Error::Credentials("api_key is not a valid header value".into()))?;
            let url = Url::parse(config.endpoint.as_deref().unwrap_or(LEGACY_ENDPOINT))?;
            Mode::Legacy { auth, url }
        };

        Ok(Self {
            name: name.to_owned(),
            client,
            mode,
            options: config.fcm_options.clone().unwrap_or_default(),
            degraded,
        })
    }

    /// Builds the string-valued `data` object, shrinking it under the size
    /// ceiling: content body first, then room name, sender display name,
    /// room alias, and finally the content map as a whole.
    fn shape_data(
        &self,
        notification: &Notification,
        device: &Device,
    ) -> std::result::Result<Map<String, Value>, Outcome> {
        let mut state = DataState::new(notification);
        loop {
            let data = build_data(notification, device, &state);
            let size = serde_json::to_vec(&Value::Object(data.clone()))
                .map_err(|_| Outcome::retryable("payload serialization failed"))?
                .len();
            if size <= PAYLOAD_SIZE_LIMIT {
                return Ok(data);
            }
            if !state.shrink(size - PAYLOAD_SIZE_LIMIT) {
                return Err(Outcome::retryable("payload too large after truncation"));
            }
        }
    }

    async fn dispatch_legacy(
        &self,
        auth: &HeaderValue,
        url: &Url,
        notification: &Notification,
        devices: &[Device],
    ) -> Vec<Outcome> {
        let data = match self.shape_data(notification, &devices[0]) {
            Ok(data) => data,
            Err(outcome) => return vec![outcome; devices.len()],
        };

        let ids: Vec<&str> = devices.iter().map(|d| d.pushkey.as_str()).collect();
        let mut body = Map::new();
        body.insert("registration_ids".to_owned(), ids.into());
        body.insert(
            "priority".to_owned(),
            priority_for(notification, devices).into(),
        );
        body.insert("data".to_owned(), Value::Object(data));
        for (key, value) in &self.options {
            body.insert(key.clone(), value.clone());
        }

        let response = send_with_retries(|| {
            let request = self
                .client
                .post(url.clone())
                .header(AUTHORIZATION, auth.clone())
                .json(&body);
            async move { request.send().await }
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return vec![Outcome::retryable(format!("transport error: {err}")); devices.len()]
            }
        };

        let status = response.status();
        let retry = retry_after(response.headers());
        match status.as_u16() {
            200 => {
                let parsed: std::result::Result<LegacyResponse, _> = response.json().await;
                match parsed {
                    Ok(body) => map_legacy_results(&self.name, devices, body.results),
                    Err(err) => {
                        warn!(pushkin = %self.name, error = %err, "unparseable FCM response");
                        vec![Outcome::retryable("unparseable upstream response"); devices.len()]
                    }
                }
            }
            401 | 403 => {
                warn!(pushkin = %self.name, %status, "FCM rejected our credentials");
                self.degraded.trip();
                vec![Outcome::retryable("credentials rejected"); devices.len()]
            }
            429 => vec![
                Outcome::retryable_after("upstream rate limited", retry);
                devices.len()
            ],
            400..=499 => {
                vec![Outcome::rejected(format!("upstream rejected the request: {status}")); devices.len()]
            }
            _ => vec![
                Outcome::retryable_after(format!("upstream error: {status}"), retry);
                devices.len()
            ],
        }
    }

    async fn dispatch_v1(
        &self,
        tokens: &AccessTokenManager,
        url: &Url,
        notification: &Notification,
        device: &Device,
    ) -> Outcome {
        let data = match self.shape_data(notification, device) {
            Ok(data) => data,
            Err(outcome) => return outcome,
        };

        let mut message = Map::new();
        message.insert("token".to_owned(), device.pushkey.as_str().into());
        message.insert("data".to_owned(), Value::Object(data));
        message.insert(
            "android".to_owned(),
            serde_json::json!({ "priority": priority_for(notification, std::slice::from_ref(device)) }),
        );
        for (key, value) in &self.options {
            message.insert(key.clone(), value.clone());
        }
        let body = serde_json::json!({ "message": message });

        let token = match tokens.get().await {
            Ok(token) => token,
            Err(err) => {
                warn!(pushkin = %self.name, error = %err, "no FCM access token");
                return Outcome::retryable("access token unavailable");
            }
        };

        let response = send_with_retries(|| {
            let request = self
                .client
                .post(url.clone())
                .bearer_auth(token.as_str())
                .json(&body);
            async move { request.send().await }
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return Outcome::retryable(format!("transport error: {err}")),
        };

        let status = response.status();
        let retry = retry_after(response.headers());
        if status.is_success() {
            return Outcome::Delivered;
        }
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Outcome::rejected("UNREGISTERED"),
            401 | 403 => {
                warn!(pushkin = %self.name, %status, "FCM rejected our credentials");
                self.degraded.trip();
                Outcome::retryable("credentials rejected")
            }
            429 => Outcome::retryable_after("upstream rate limited", retry),
            400..=499 if body.contains("UNREGISTERED") => Outcome::rejected("UNREGISTERED"),
            400..=499 => Outcome::rejected(format!("upstream rejected the request: {status}")),
            _ => Outcome::retryable_after(format!("upstream error: {status}"), retry),
        }
    }
}

#[async_trait]
impl Pushkin for FcmPushkin {
    fn kind(&self) -> &'static str {
        "gcm"
    }

    fn max_batch_size(&self) -> usize {
        match &self.mode {
            Mode::Legacy { .. } => MAX_REGISTRATION_IDS,
            Mode::V1 { .. } => 1,
        }
    }

    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome> {
        match &self.mode {
            Mode::Legacy { auth, url } => {
                self.dispatch_legacy(auth, url, notification, devices).await
            }
            Mode::V1 { tokens, url } => {
                let mut outcomes = Vec::with_capacity(devices.len());
                for device in devices {
                    outcomes.push(self.dispatch_v1(tokens, url, notification, device).await);
                }
                outcomes
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    results: Option<Vec<LegacyResult>>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[allow(dead_code)]
    message_id: Option<String>,
    registration_id: Option<String>,
    error: Option<String>,
}

fn map_legacy_results(
    name: &str,
    devices: &[Device],
    results: Option<Vec<LegacyResult>>,
) -> Vec<Outcome> {
    let results = results.unwrap_or_default();
    devices
        .iter()
        .enumerate()
        .map(|(index, device)| match results.get(index) {
            None => Outcome::retryable("missing result for registration id"),
            Some(result) => {
                if let Some(canonical) = &result.registration_id {
                    info!(
                        pushkin = %name,
                        pushkey = %device.pushkey,
                        canonical = %canonical,
                        "FCM reports an updated canonical registration id"
                    );
                }
                match result.error.as_deref() {
                    None => Outcome::Delivered,
                    Some(error) if LEGACY_REJECT_ERRORS.contains(&error) => {
                        Outcome::rejected(error)
                    }
                    Some(error) if LEGACY_RETRY_ERRORS.contains(&error) => {
                        Outcome::retryable(error)
                    }
                    Some(error) => {
                        warn!(pushkin = %name, error, "unrecognised FCM result error");
                        Outcome::rejected(error)
                    }
                }
            }
        })
        .collect()
}

fn priority_for(notification: &Notification, devices: &[Device]) -> &'static str {
    let call_invite = notification.event_type.as_deref() == Some("m.call.invite");
    if call_invite || devices.iter().any(Device::tweak_highlight) {
        "high"
    } else {
        "normal"
    }
}

/// Alert inputs under the shrinker's control.
struct DataState {
    body: Option<String>,
    room_name: Option<String>,
    sender_display: Option<String>,
    room_alias: Option<String>,
    include_content: bool,
}

impl DataState {
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

fn build_data(notification: &Notification, device: &Device, state: &DataState) -> Map<String, Value> {
    let mut data: Map<String, Value> = device.default_payload().cloned().unwrap_or_default();

    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            data.insert(key.to_owned(), value);
        }
    };

    set("event_id", notification.event_id.as_deref().map(Value::from));
    set("type", notification.event_type.as_deref().map(Value::from));
    set("sender", notification.sender.as_deref().map(Value::from));
    set(
        "sender_display_name",
        state.sender_display.as_deref().map(Value::from),
    );
    set("room_name", state.room_name.as_deref().map(Value::from));
    set("room_alias", state.room_alias.as_deref().map(Value::from));
    set("room_id", notification.room_id.as_deref().map(Value::from));
    set(
        "prio",
        Some(notification.priority().as_str().into()),
    );
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
            set("content", Some(Value::Object(content)));
        }
    }

    // FCM data values must be strings; JSON-encode everything else.
    for value in data.values_mut() {
        if !value.is_string() {
            *value = Value::String(value.to_string());
        }
    }
    data
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn notification() -> Notification {
        serde_json::from_value::<Notification>(json!({
            "event_id": "$ev:example.com",
            "room_id": "!room:example.com",
            "type": "m.room.message",
            "sender": "@alice:example.com",
            "sender_display_name": "Alice",
            "content": {"msgtype": "m.text", "body": "hello"},
            "counts": {"unread": 3},
        }))
        .unwrap()
        .normalize()
    }

    fn device(pushkey: &str) -> Device {
        Device {
            app_id: "com.example.myapp.android".to_owned(),
            pushkey: pushkey.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn data_values_are_all_strings() {
        let notification = notification();
        let state = DataState::new(&notification);
        let data = build_data(&notification, &device("reg-1"), &state);

        assert!(data.values().all(Value::is_string));
        assert_eq!(data["unread"], "3");
        assert_eq!(data["prio"], "high");

        // The content map survives the string pass as embedded JSON.
        let content: Value = serde_json::from_str(data["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["body"], "hello");
    }

    #[test]
    fn data_fields_round_trip_through_json() {
        let notification = notification();
        let state = DataState::new(&notification);
        let data = build_data(&notification, &device("reg-1"), &state);

        let serialized = serde_json::to_string(&Value::Object(data.clone())).unwrap();
        let reparsed: Map<String, Value> = serde_json::from_str(&serialized).unwrap();
        assert_eq!(reparsed, data);
    }

    #[test]
    fn legacy_results_map_per_device() {
        let devices = [device("reg-1"), device("reg-2"), device("reg-3"), device("reg-4")];
        let results = vec![
            LegacyResult {
                message_id: Some("m1".into()),
                registration_id: None,
                error: None,
            },
            LegacyResult {
                message_id: None,
                registration_id: None,
                error: Some("NotRegistered".into()),
            },
            LegacyResult {
                message_id: None,
                registration_id: None,
                error: Some("Unavailable".into()),
            },
            LegacyResult {
                message_id: Some("m4".into()),
                registration_id: Some("new-reg-4".into()),
                error: None,
            },
        ];

        let outcomes = map_legacy_results("app", &devices, Some(results));
        assert_eq!(outcomes[0], Outcome::Delivered);
        assert_eq!(
            outcomes[1],
            Outcome::rejected("NotRegistered")
        );
        assert!(matches!(outcomes[2], Outcome::Retryable { .. }));
        assert_eq!(outcomes[3], Outcome::Delivered);
    }

    #[test]
    fn short_results_array_leaves_devices_retryable() {
        let devices = [device("reg-1"), device("reg-2")];
        let results = vec![LegacyResult {
            message_id: Some("m1".into()),
            registration_id: None,
            error: None,
        }];
        let outcomes = map_legacy_results("app", &devices, Some(results));
        assert_eq!(outcomes[0], Outcome::Delivered);
        assert!(matches!(outcomes[1], Outcome::Retryable { .. }));
    }

    #[test]
    fn priority_follows_highlight_and_call_invites() {
        let mut n = notification();
        let plain = device("reg-1");
        assert_eq!(priority_for(&n, std::slice::from_ref(&plain)), "normal");

        let mut highlighted = device("reg-2");
        highlighted.tweaks = Some(
            json!({"highlight": true})
                .as_object()
                .unwrap()
                .clone(),
        );
        assert_eq!(priority_for(&n, &[plain.clone(), highlighted]), "high");

        n.event_type = Some("m.call.invite".to_owned());
        assert_eq!(priority_for(&n, std::slice::from_ref(&plain)), "high");
    }

    #[test]
    fn oversized_content_is_truncated_under_the_cap() {
        let mut n = notification();
        n.content
            .as_mut()
            .unwrap()
            .insert("body".to_owned(), json!("y".repeat(30_000)));

        let mut state = DataState::new(&n);
        loop {
            let data = build_data(&n, &device("reg-1"), &state);
            let size = serde_json::to_vec(&Value::Object(data)).unwrap().len();
            if size <= PAYLOAD_SIZE_LIMIT {
                break;
            }
            assert!(state.shrink(size - PAYLOAD_SIZE_LIMIT));
        }
    }
}
