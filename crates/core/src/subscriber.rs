// Subscriber entity
//
// Subscribers are owned by the list-management side of the product. The
// engine only reads them: status for targeting, segments for membership and
// named attributes for condition evaluation and trigger predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Subscription status of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    #[default]
    Pending,
    Active,
    Unsubscribed,
    Bounced,
    Complained,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
        }
    }
}

impl std::fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscriber an automation runs against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub status: SubscriberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Ids of the segments this subscriber belongs to
    #[serde(default)]
    pub segments: Vec<String>,
    /// Free-form attributes (birthday, lastActivityAt, plan, ...)
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            email: email.into(),
            status: SubscriberStatus::Active,
            first_name: None,
            last_name: None,
            segments: vec![],
            custom_fields: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: SubscriberStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_segment(mut self, segment_id: impl Into<String>) -> Self {
        self.segments.push(segment_id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_fields.insert(name.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }

    pub fn in_segment(&self, segment_id: &str) -> bool {
        self.segments.iter().any(|s| s == segment_id)
    }

    /// Read a named attribute. Built-in fields are addressed by their
    /// camelCase wire names; anything else is looked up in `custom_fields`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "email" => Some(Value::String(self.email.clone())),
            "status" => Some(Value::String(self.status.as_str().to_string())),
            "firstName" => self.first_name.clone().map(Value::String),
            "lastName" => self.last_name.clone().map(Value::String),
            "segments" => Some(Value::Array(
                self.segments.iter().cloned().map(Value::String).collect(),
            )),
            "createdAt" | "subscribedAt" => Some(Value::String(self.created_at.to_rfc3339())),
            other => self.custom_fields.get(other).filter(|v| !v.is_null()).cloned(),
        }
    }

    /// Read a named attribute as a timestamp. Accepts RFC 3339 strings,
    /// plain `YYYY-MM-DD` dates and epoch milliseconds.
    pub fn date_attribute(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.attribute(name)? {
            Value::String(s) => parse_date(&s),
            Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        }
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};
    use serde_json::json;

    #[test]
    fn test_builtin_attributes() {
        let sub = Subscriber::new("ada@example.com").with_status(SubscriberStatus::Active);
        assert_eq!(sub.attribute("status"), Some(json!("active")));
        assert_eq!(sub.attribute("email"), Some(json!("ada@example.com")));
        assert_eq!(sub.attribute("firstName"), None);
    }

    #[test]
    fn test_custom_field_attributes() {
        let sub = Subscriber::new("a@example.com")
            .with_field("plan", "pro")
            .with_field("score", 42)
            .with_field("nothing", Value::Null);
        assert_eq!(sub.attribute("plan"), Some(json!("pro")));
        assert_eq!(sub.attribute("score"), Some(json!(42)));
        assert_eq!(sub.attribute("nothing"), None);
        assert_eq!(sub.attribute("missing"), None);
    }

    #[test]
    fn test_date_attribute_formats() {
        let sub = Subscriber::new("a@example.com")
            .with_field("birthday", "1990-04-12")
            .with_field("lastActivityAt", "2024-01-02T10:00:00Z")
            .with_field("cartUpdatedAt", 1_704_189_600_000_i64);

        let birthday = sub.date_attribute("birthday").unwrap();
        assert_eq!((birthday.month(), birthday.day()), (4, 12));

        assert_eq!(
            sub.date_attribute("lastActivityAt"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap())
        );
        assert_eq!(
            sub.date_attribute("cartUpdatedAt"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_segment_membership() {
        let sub = Subscriber::new("a@example.com").with_segment("vip");
        assert!(sub.in_segment("vip"));
        assert!(!sub.in_segment("churned"));
    }
}
