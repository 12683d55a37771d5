use serde::{Deserialize, Serialize};

/// Client preferences synced through the `app.roomkeeper.preferences`
/// account data event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Never raise alerts, even when push rules say to notify.
    #[serde(default)]
    pub disable_notifications: bool,

    /// Don't show who is typing.
    #[serde(default)]
    pub disable_typing_notifications: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preferences_default_when_fields_missing() {
        let prefs: Preferences = serde_json::from_value(json!({})).unwrap();
        assert_eq!(prefs, Preferences::default());
        assert!(!prefs.disable_notifications);
    }

    #[test]
    fn test_preferences_ignores_unknown_fields() {
        let prefs: Preferences = serde_json::from_value(json!({
            "disable_notifications": true,
            "some_future_flag": 3
        }))
        .unwrap();
        assert!(prefs.disable_notifications);
        assert!(!prefs.disable_typing_notifications);
    }
}
