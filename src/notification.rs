use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The payload format value that collapses content fields to identifiers.
pub const FORMAT_EVENT_ID_ONLY: &str = "event_id_only";

/// A normalized inbound notification.
///
/// The wire shape is the Matrix Push Gateway `notification` object; the only
/// rewriting [`Notification::normalize`] performs is flattening the nested
/// `counts` into the top-level `unread` and `missed_calls` fields and
/// defaulting the priority, so the operation is idempotent.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_alias: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,

    #[serde(default)]
    pub user_is_target: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prio: Option<Priority>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Map<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<Counts>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_calls: Option<u64>,

    /// Payload format hint; a device's `data.format` wins over this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    High,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Counts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed_calls: Option<u64>,
}

/// One push target of a notification.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Device {
    pub app_id: String,

    pub pushkey: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushkey_ts: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DeviceData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tweaks: Option<Map<String, Value>>,
}

/// The free-form `data` bag the homeserver stores with the pusher.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_payload: Option<Map<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default)]
    pub events_only: bool,

    #[serde(default)]
    pub only_last_per_room: bool,

    /// Set at pusher registration; carries no meaning at dispatch time.
    #[serde(default)]
    pub append: bool,

    /// WebPush subscription endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// WebPush subscription auth secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    /// Canonicalizes the notification: `counts` is flattened into the
    /// top-level fields and the priority defaults to high. Idempotent.
    pub fn normalize(mut self) -> Self {
        if let Some(counts) = self.counts.take() {
            if self.unread.is_none() {
                self.unread = counts.unread;
            }
            if self.missed_calls.is_none() {
                self.missed_calls = counts.missed_calls;
            }
        }
        self.prio = Some(self.prio.unwrap_or_default());
        self
    }

    pub fn priority(&self) -> Priority {
        self.prio.unwrap_or_default()
    }

    /// The `msgtype` of the event content, if any.
    pub fn msgtype(&self) -> Option<&str> {
        self.content.as_ref()?.get("msgtype")?.as_str()
    }

    /// The `body` of the event content, if any.
    pub fn content_body(&self) -> Option<&str> {
        self.content.as_ref()?.get("body")?.as_str()
    }

    /// Whichever of the sender's display name or id is available.
    pub fn sender_display(&self) -> Option<&str> {
        self.sender_display_name
            .as_deref()
            .or(self.sender.as_deref())
    }
}

impl Device {
    /// The effective payload format: the device's own `data.format` wins
    /// over the notification-level hint.
    pub fn effective_format<'a>(&'a self, notification: &'a Notification) -> Option<&'a str> {
        self.data
            .as_ref()
            .and_then(|data| data.format.as_deref())
            .or(notification.format.as_deref())
    }

    pub fn default_payload(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()?.default_payload.as_ref()
    }

    /// The `sound` tweak, when it is a plain string.
    pub fn tweak_sound(&self) -> Option<&str> {
        self.tweaks.as_ref()?.get("sound")?.as_str()
    }

    pub fn tweak_highlight(&self) -> bool {
        self.tweaks
            .as_ref()
            .and_then(|tweaks| tweaks.get("highlight"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `topic` tweak forwarded as the WebPush `Topic` header.
    pub fn tweak_topic(&self) -> Option<&str> {
        self.tweaks.as_ref()?.get("topic")?.as_str()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn sample() -> Notification {
        serde_json::from_value(json!({
            "event_id": "$event:example.com",
            "room_id": "!room:example.com",
            "type": "m.room.message",
            "sender": "@alice:example.com",
            "counts": {"unread": 3, "missed_calls": 1},
            "devices": [{
                "app_id": "com.example.app",
                "pushkey": "token",
                "data": {"format": "event_id_only"},
            }],
        }))
        .unwrap()
    }

    #[test]
    fn normalize_flattens_counts() {
        let normalized = sample().normalize();
        assert_eq!(normalized.unread, Some(3));
        assert_eq!(normalized.missed_calls, Some(1));
        assert_eq!(normalized.counts, None);
        assert_eq!(normalized.prio, Some(Priority::High));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = sample().normalize();
        let twice = once.clone().normalize();
        assert_eq!(once, twice);
    }

    #[test]
    fn device_format_wins_over_notification_format() {
        let mut notification = sample().normalize();
        notification.format = Some("full".to_owned());
        let device = &notification.devices[0];
        assert_eq!(device.effective_format(&notification), Some("event_id_only"));

        let bare = Device {
            app_id: "com.example.app".to_owned(),
            pushkey: "token".to_owned(),
            ..Default::default()
        };
        assert_eq!(bare.effective_format(&notification), Some("full"));
    }

    #[test]
    fn tweaks_accessors_tolerate_odd_values() {
        let device: Device = serde_json::from_value(json!({
            "app_id": "a",
            "pushkey": "k",
            "tweaks": {"sound": {"name": "bing"}, "highlight": 1},
        }))
        .unwrap();
        assert_eq!(device.tweak_sound(), None);
        assert!(!device.tweak_highlight());
    }
}
