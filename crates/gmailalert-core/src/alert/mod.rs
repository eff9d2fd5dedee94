//! Alert definitions and the alert configuration file.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A Gmail query to watch and the Pushover notification to send on a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Gmail search expression, e.g. `is:unread from:billing@example.com`.
    #[serde(rename = "gmailquery", default)]
    pub gmail_query: String,
    /// Pushover user or group key receiving the notification.
    #[serde(rename = "pushovertarget", default)]
    pub pushover_target: String,
    /// Notification title.
    #[serde(rename = "pushovertitle", default)]
    pub pushover_title: String,
    /// Pushover sound name.
    #[serde(rename = "pushoversound", default)]
    pub pushover_sound: String,
}

impl Alert {
    /// Checks that every field is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        let missing = if self.gmail_query.is_empty() {
            "gmail query"
        } else if self.pushover_title.is_empty() {
            "pushover title"
        } else if self.pushover_sound.is_empty() {
            "pushover sound"
        } else if self.pushover_target.is_empty() {
            "pushover target"
        } else {
            return Ok(());
        };
        Err(Error::Config(format!(
            "alert must have a non-empty {missing} field"
        )))
    }

    /// Builds the notification reporting `matches` messages for this alert.
    #[must_use]
    pub fn notification(&self, matches: usize) -> Notification {
        Notification {
            recipient: self.pushover_target.clone(),
            title: self.pushover_title.clone(),
            message: format!(
                "found {matches} emails matching query \"{}\"",
                self.gmail_query
            ),
            sound: self.pushover_sound.clone(),
        }
    }
}

/// Pushover application token and the alerts to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Pushover application token.
    #[serde(rename = "pushoverapp", default)]
    pub pushover_app: String,
    /// Alerts to evaluate.
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl AlertConfig {
    /// Decodes an alert configuration document.
    ///
    /// Individual alerts are validated when processed, not here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is not valid JSON.
    pub fn from_json(document: &[u8]) -> Result<Self> {
        serde_json::from_slice(document)
            .map_err(|e| Error::Config(format!("got an error decoding JSON: {e}")))
    }
}

/// A push notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Pushover user or group key.
    pub recipient: String,
    /// Title.
    pub title: String,
    /// Body.
    pub message: String,
    /// Pushover sound name, may be empty.
    pub sound: String,
}

impl Notification {
    /// Checks that the message, title, and recipient are set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        let missing = if self.message.is_empty() {
            "message"
        } else if self.title.is_empty() {
            "title"
        } else if self.recipient.is_empty() {
            "recipient"
        } else {
            return Ok(());
        };
        Err(Error::Config(format!(
            "notification must contain a non-empty {missing}"
        )))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn alert() -> Alert {
        Alert {
            gmail_query: "is:unread subject:Payment Due!".into(),
            pushover_target: "user-key".into(),
            pushover_title: "Payment due".into(),
            pushover_sound: "cashregister".into(),
        }
    }

    #[test]
    fn test_decode_alert_config() {
        let doc = br#"{
            "pushoverapp": "app-token",
            "alerts": [
                {
                    "gmailquery": "is:unread from:bank",
                    "pushovertarget": "user-key",
                    "pushovertitle": "Bank",
                    "pushoversound": "siren"
                }
            ]
        }"#;
        let config = AlertConfig::from_json(doc).unwrap();
        assert_eq!(config.pushover_app, "app-token");
        assert_eq!(
            config.alerts,
            vec![Alert {
                gmail_query: "is:unread from:bank".into(),
                pushover_target: "user-key".into(),
                pushover_title: "Bank".into(),
                pushover_sound: "siren".into(),
            }]
        );
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = AlertConfig::from_json(b"this-is-not-json").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("decoding JSON")));
    }

    #[test]
    fn test_decode_keeps_incomplete_alerts() {
        let config = AlertConfig::from_json(br#"{"alerts":[{"gmailquery":"q"}]}"#).unwrap();
        assert_eq!(config.pushover_app, "");
        assert!(config.alerts[0].validate().is_err());
    }

    #[test]
    fn test_alert_validation() {
        assert!(alert().validate().is_ok());

        let cases: [(fn(&mut Alert), &str); 4] = [
            (|a| a.gmail_query.clear(), "gmail query"),
            (|a| a.pushover_title.clear(), "pushover title"),
            (|a| a.pushover_sound.clear(), "pushover sound"),
            (|a| a.pushover_target.clear(), "pushover target"),
        ];
        for (clear, field) in cases {
            let mut invalid = alert();
            clear(&mut invalid);
            let err = invalid.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{err}");
        }
    }

    #[test]
    fn test_notification_message() {
        let notification = alert().notification(3);
        assert_eq!(
            notification.message,
            "found 3 emails matching query \"is:unread subject:Payment Due!\""
        );
        assert_eq!(notification.recipient, "user-key");
        assert_eq!(notification.sound, "cashregister");
        assert!(notification.validate().is_ok());
    }

    #[test]
    fn test_notification_validation() {
        let valid = Notification {
            recipient: "Bob".into(),
            title: "Alert".into(),
            message: "Got an alert".into(),
            sound: String::new(),
        };
        assert!(valid.validate().is_ok());

        for (field, invalid) in [
            ("message", Notification { message: String::new(), ..valid.clone() }),
            ("title", Notification { title: String::new(), ..valid.clone() }),
            ("recipient", Notification { recipient: String::new(), ..valid.clone() }),
        ] {
            let err = invalid.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{err}");
        }
    }
}
