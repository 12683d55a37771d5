//! Relation classification and folding
//!
//! Decides whether an incoming event is a primary timeline entry or a relation
//! to an earlier event (edit, reaction, redaction), and computes the in-place
//! mutation to apply to the target. Applying the mutation to the stored record
//! is the caller's job; the functions here are pure.

use serde_json::{Map, Value};

use super::events::{EVENT_REACTION, Edit, Event, RedactionCause};

pub const REL_REPLACE: &str = "m.replace";
pub const REL_ANNOTATION: &str = "m.annotation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Primary,
    Edit { target_id: String },
    Reaction { target_id: String, key: String },
    Redaction { target_id: String },
}

/// Classify an event by its relation to earlier events.
///
/// Precedence: an explicit `redacts` reference, then an `m.replace` relation,
/// then (only for reaction events) an `m.annotation` relation. Anything
/// malformed falls through to [`Relation::Primary`].
pub fn classify(event: &Event) -> Relation {
    if let Some(target_id) = event.redacts.as_deref().filter(|id| !id.is_empty()) {
        return Relation::Redaction {
            target_id: target_id.to_string(),
        };
    }

    let Some(relates_to) = event.content.get("m.relates_to").and_then(Value::as_object) else {
        return Relation::Primary;
    };
    let rel_type = relates_to.get("rel_type").and_then(Value::as_str);
    let target_id = relates_to
        .get("event_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());

    match (rel_type, target_id) {
        (Some(REL_REPLACE), Some(target_id)) => Relation::Edit {
            target_id: target_id.to_string(),
        },
        (Some(REL_ANNOTATION), Some(target_id)) if event.event_type == EVENT_REACTION => {
            match relates_to.get("key").and_then(Value::as_str) {
                Some(key) if !key.is_empty() => Relation::Reaction {
                    target_id: target_id.to_string(),
                    key: key.to_string(),
                },
                _ => Relation::Primary,
            }
        }
        _ => Relation::Primary,
    }
}

/// Replacement content carried by an edit event. Prefers `m.new_content`,
/// falling back to the edit's own content minus the relation block.
pub fn edit_content(edit_event: &Event) -> Value {
    if let Some(new_content) = edit_event.content.get("m.new_content") {
        return new_content.clone();
    }
    match &edit_event.content {
        Value::Object(map) => {
            let mut content = map.clone();
            content.remove("m.relates_to");
            Value::Object(content)
        }
        other => other.clone(),
    }
}

pub fn apply_edit(target: &mut Event, edit_event: &Event) {
    target.edits.push(Edit {
        event_id: edit_event.id.clone(),
        sender: edit_event.sender.clone(),
        timestamp: edit_event.timestamp,
        content: edit_content(edit_event),
    });
}

/// One increment per reaction event, no matter who sent it.
pub fn apply_reaction(target: &mut Event, key: &str) {
    *target.reactions.entry(key.to_string()).or_insert(0) += 1;
}

/// Mark the target as redacted and scrub what it said. The record itself
/// stays addressable.
pub fn apply_redaction(target: &mut Event, redaction: &Event) {
    target.redacted_by = Some(redaction.id.clone());
    target.redaction_cause = Some(RedactionCause {
        event_id: redaction.id.clone(),
        sender: redaction.sender.clone(),
        reason: redaction
            .content
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        timestamp: redaction.timestamp,
    });
    target.content = Value::Object(Map::new());
    target.edits.clear();
    target.reactions.clear();
}

impl Relation {
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Relation::Primary => None,
            Relation::Edit { target_id }
            | Relation::Reaction { target_id, .. }
            | Relation::Redaction { target_id } => Some(target_id),
        }
    }

    /// Fold `relation_event` into `target`. A redacted target only takes
    /// further redactions.
    pub fn apply(&self, target: &mut Event, relation_event: &Event) {
        match self {
            Relation::Primary => {}
            Relation::Edit { .. } | Relation::Reaction { .. } if target.is_redacted() => {}
            Relation::Edit { .. } => apply_edit(target, relation_event),
            Relation::Reaction { key, .. } => apply_reaction(target, key),
            Relation::Redaction { .. } => apply_redaction(target, relation_event),
        }
    }
}

/// Content of an edit event replacing `target_id` with `new_content`.
pub fn replacement_content(target_id: &str, new_content: &Value) -> Value {
    let mut content = Map::new();
    if let Some(msgtype) = new_content.get("msgtype") {
        content.insert("msgtype".to_string(), msgtype.clone());
    }
    if let Some(body) = new_content.get("body").and_then(Value::as_str) {
        content.insert("body".to_string(), Value::String(format!("* {body}")));
    }
    content.insert("m.new_content".to_string(), new_content.clone());
    content.insert(
        "m.relates_to".to_string(),
        serde_json::json!({"rel_type": REL_REPLACE, "event_id": target_id}),
    );
    Value::Object(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roomkeeper::events::{EVENT_MESSAGE, EVENT_REDACTION};
    use serde_json::json;

    fn message(id: &str, content: Value) -> Event {
        Event::new(id, "!room", "@alice", EVENT_MESSAGE, 1000, content)
    }

    #[test]
    fn test_classify_plain_message_is_primary() {
        let event = message("$a", json!({"body": "hi"}));
        assert_eq!(classify(&event), Relation::Primary);
    }

    #[test]
    fn test_classify_edit() {
        let event = message(
            "$edit",
            json!({
                "body": "* fixed",
                "m.new_content": {"body": "fixed"},
                "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
            }),
        );
        assert_eq!(
            classify(&event),
            Relation::Edit {
                target_id: "$orig".to_string()
            }
        );
    }

    #[test]
    fn test_classify_reaction_only_for_reaction_type() {
        let content = json!({
            "m.relates_to": {"rel_type": "m.annotation", "event_id": "$orig", "key": "👍"}
        });
        let reaction = Event::new("$r", "!room", "@bob", EVENT_REACTION, 1, content.clone());
        assert_eq!(
            classify(&reaction),
            Relation::Reaction {
                target_id: "$orig".to_string(),
                key: "👍".to_string()
            }
        );

        // Annotation relation on a plain message is not a reaction
        let not_reaction = message("$m", content);
        assert_eq!(classify(&not_reaction), Relation::Primary);
    }

    #[test]
    fn test_classify_redaction_wins_over_relations() {
        let mut event = Event::new(
            "$red",
            "!room",
            "@bob",
            EVENT_REDACTION,
            1,
            json!({"m.relates_to": {"rel_type": "m.replace", "event_id": "$other"}}),
        );
        event.redacts = Some("$orig".to_string());
        assert_eq!(
            classify(&event),
            Relation::Redaction {
                target_id: "$orig".to_string()
            }
        );
    }

    #[test]
    fn test_classify_malformed_relations_fail_open() {
        let cases = vec![
            json!({"m.relates_to": "not an object"}),
            json!({"m.relates_to": {"rel_type": "m.replace"}}),
            json!({"m.relates_to": {"rel_type": "m.replace", "event_id": ""}}),
            json!({"m.relates_to": {"rel_type": "m.unknown", "event_id": "$x"}}),
        ];
        for content in cases {
            assert_eq!(classify(&message("$m", content)), Relation::Primary);
        }

        let reaction_without_key = Event::new(
            "$r",
            "!room",
            "@bob",
            EVENT_REACTION,
            1,
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$orig"}}),
        );
        assert_eq!(classify(&reaction_without_key), Relation::Primary);

        let mut empty_redacts = message("$m", json!({}));
        empty_redacts.redacts = Some(String::new());
        assert_eq!(classify(&empty_redacts), Relation::Primary);
    }

    #[test]
    fn test_edit_content_prefers_new_content() {
        let edit = message(
            "$e",
            json!({
                "body": "* new",
                "m.new_content": {"body": "new"},
                "m.relates_to": {"rel_type": "m.replace", "event_id": "$o"}
            }),
        );
        assert_eq!(edit_content(&edit), json!({"body": "new"}));

        let bare = message(
            "$e2",
            json!({
                "body": "new",
                "m.relates_to": {"rel_type": "m.replace", "event_id": "$o"}
            }),
        );
        assert_eq!(edit_content(&bare), json!({"body": "new"}));
    }

    #[test]
    fn test_apply_edits_latest_wins() {
        let mut original = message("$o", json!({"body": "v1"}));
        let edit1 = message("$e1", json!({"m.new_content": {"body": "v2"}}));
        let edit2 = message("$e2", json!({"m.new_content": {"body": "v3"}}));

        apply_edit(&mut original, &edit1);
        assert_eq!(original.body(), Some("v2"));
        apply_edit(&mut original, &edit2);
        assert_eq!(original.body(), Some("v3"));
        assert_eq!(original.edits.len(), 2);
        assert_eq!(original.id, "$o");
    }

    #[test]
    fn test_apply_reaction_counts_every_event() {
        let mut original = message("$o", json!({"body": "hi"}));
        apply_reaction(&mut original, "👍");
        apply_reaction(&mut original, "👍");
        apply_reaction(&mut original, "❤️");

        assert_eq!(original.reactions.get("👍"), Some(&2));
        assert_eq!(original.reactions.get("❤️"), Some(&1));
    }

    #[test]
    fn test_apply_redaction_scrubs_and_marks() {
        let mut original = message("$o", json!({"body": "secret"}));
        apply_reaction(&mut original, "👍");
        apply_edit(&mut original, &message("$e", json!({"m.new_content": {"body": "x"}})));

        let mut redaction = Event::new(
            "$red",
            "!room",
            "@mod",
            EVENT_REDACTION,
            5000,
            json!({"reason": "spam"}),
        );
        redaction.redacts = Some("$o".to_string());
        apply_redaction(&mut original, &redaction);

        assert!(original.is_redacted());
        assert_eq!(original.redacted_by.as_deref(), Some("$red"));
        let cause = original.redaction_cause.as_ref().unwrap();
        assert_eq!(cause.sender, "@mod");
        assert_eq!(cause.reason.as_deref(), Some("spam"));
        assert_eq!(original.body(), None);
        assert!(original.edits.is_empty());
        assert!(original.reactions.is_empty());
        assert_eq!(original.id, "$o");
    }

    #[test]
    fn test_redacted_target_only_takes_redactions() {
        let mut original = message("$o", json!({"body": "secret"}));
        let mut redaction = Event::new("$red", "!room", "@mod", EVENT_REDACTION, 5000, json!({}));
        redaction.redacts = Some("$o".to_string());
        classify(&redaction).apply(&mut original, &redaction);

        let edit = message("$e", replacement_content("$o", &json!({"body": "back"})));
        classify(&edit).apply(&mut original, &edit);
        Relation::Reaction {
            target_id: "$o".to_string(),
            key: "👍".to_string(),
        }
        .apply(&mut original, &edit);

        assert_eq!(original.body(), None);
        assert!(original.edits.is_empty());
        assert!(original.reactions.is_empty());
    }

    #[test]
    fn test_replacement_content_round_trips_through_classify() {
        let new_content = json!({"msgtype": "m.text", "body": "fixed"});
        let content = replacement_content("$orig", &new_content);
        assert_eq!(content["body"], "* fixed");

        let edit = message("$edit", content);
        let relation = classify(&edit);
        assert_eq!(relation.target_id(), Some("$orig"));

        let mut original = message("$orig", json!({"msgtype": "m.text", "body": "typo"}));
        relation.apply(&mut original, &edit);
        assert_eq!(original.body(), Some("fixed"));
    }
}
