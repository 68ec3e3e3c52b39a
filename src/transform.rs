//! Bucket notification to CloudEvent mapping
//!
//! [`to_event`] is pure: the same notification, bucket and extensions always
//! produce the same [`StructuredEvent`], including its `id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clients::Notification;

/// CloudEvents `type` for every event emitted by this source
pub const EVENT_TYPE: &str = "io.noobaa.bucket.object.notification";

/// CloudEvents spec version
pub const SPEC_VERSION: &str = "1.0";

/// Attribute names user extensions may never set
pub const RESERVED_ATTRIBUTES: &[&str] = &[
    "specversion",
    "id",
    "type",
    "source",
    "subject",
    "time",
    "datacontenttype",
    "dataschema",
    "data",
    "data_base64",
];

const MAX_ATTRIBUTE_NAME_LEN: usize = 20;

/// A CloudEvent in structured JSON mode
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StructuredEvent {
    pub specversion: &'static str,
    pub id: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub datacontenttype: &'static str,
    pub data: serde_json::Value,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, String>,
}

/// CloudEvents `source` for a bucket
pub fn bucket_source(bucket: &str) -> String {
    format!("noobaa://buckets/{}", bucket)
}

/// Map one notification to a structured event
pub fn to_event(
    notification: &Notification,
    bucket: &str,
    extensions: &BTreeMap<String, String>,
) -> StructuredEvent {
    let subject = if notification.key.is_empty() {
        None
    } else {
        Some(notification.key.clone())
    };

    StructuredEvent {
        specversion: SPEC_VERSION,
        id: event_id(notification, bucket),
        type_: EVENT_TYPE,
        source: bucket_source(bucket),
        subject,
        time: notification.time,
        datacontenttype: "application/json",
        data: notification.payload.clone(),
        extensions: merge_extensions(extensions),
    }
}

/// Keep only extensions with valid, non-reserved attribute names
fn merge_extensions(extensions: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    extensions
        .iter()
        .filter(|(name, _)| is_valid_extension_name(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// CloudEvents attribute names are 1-20 lowercase ASCII letters or digits
pub fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ATTRIBUTE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && !RESERVED_ATTRIBUTES.contains(&name)
}

fn event_id(notification: &Notification, bucket: &str) -> String {
    if let Some(id) = notification.id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let name = format!(
        "{}/{}/{}/{}",
        bucket,
        notification.key,
        notification.event_name.as_deref().unwrap_or_default(),
        notification
            .time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn notification(key: &str) -> Notification {
        Notification {
            id: None,
            key: key.to_string(),
            event_name: Some("ObjectCreated:Put".to_string()),
            time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            payload: json!({ "key": key }),
        }
    }

    #[test]
    fn maps_core_attributes() {
        let event = to_event(&notification("o1"), "b1", &BTreeMap::new());

        assert_eq!(event.type_, EVENT_TYPE);
        assert_eq!(event.source, "noobaa://buckets/b1");
        assert_eq!(event.subject.as_deref(), Some("o1"));
        assert_eq!(event.data, json!({ "key": "o1" }));
        assert!(event.extensions.is_empty());
    }

    #[test]
    fn same_input_yields_identical_event() {
        let mut ext = BTreeMap::new();
        ext.insert("team".to_string(), "storage".to_string());

        let a = to_event(&notification("o1"), "b1", &ext);
        let b = to_event(&notification("o1"), "b1", &ext);
        assert_eq!(a, b);

        let c = to_event(&notification("o2"), "b1", &ext);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn notification_id_is_preferred() {
        let mut n = notification("o1");
        n.id = Some("evt-42".to_string());
        assert_eq!(to_event(&n, "b1", &BTreeMap::new()).id, "evt-42");
    }

    #[test]
    fn reserved_attributes_win_over_extensions() {
        let mut ext = BTreeMap::new();
        ext.insert("type".to_string(), "spoofed".to_string());
        ext.insert("source".to_string(), "spoofed".to_string());
        ext.insert("subject".to_string(), "spoofed".to_string());
        ext.insert("data".to_string(), "spoofed".to_string());
        ext.insert("team".to_string(), "storage".to_string());

        let event = to_event(&notification("o1"), "b1", &ext);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], EVENT_TYPE);
        assert_eq!(json["source"], "noobaa://buckets/b1");
        assert_eq!(json["subject"], "o1");
        assert_eq!(json["data"], json!({ "key": "o1" }));
        assert_eq!(json["team"], "storage");
        assert_eq!(event.extensions.len(), 1);
    }

    #[test]
    fn invalid_extension_names_are_dropped() {
        assert!(is_valid_extension_name("team"));
        assert!(is_valid_extension_name("tier2"));
        assert!(!is_valid_extension_name("Team"));
        assert!(!is_valid_extension_name("my-team"));
        assert!(!is_valid_extension_name(""));
        assert!(!is_valid_extension_name("abcdefghijklmnopqrstu"));
    }

    #[test]
    fn structured_json_shape() {
        let event = to_event(&notification("o1"), "b1", &BTreeMap::new());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["datacontenttype"], "application/json");
        assert_eq!(json["time"], "2024-05-01T12:00:00Z");
    }
}
