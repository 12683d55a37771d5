use crate::roomkeeper::event_processor::SyncContext;
use crate::roomkeeper::events::{Event, SourceFlags};
use crate::roomkeeper::relations::{Relation, classify};

impl SyncContext {
    pub(crate) async fn handle_redaction(&mut self, _source: SourceFlags, event: Event) {
        let room_id = event.room_id.clone();
        match classify(&event) {
            relation @ Relation::Redaction { .. } => {
                self.apply_relation(&room_id, relation, event).await
            }
            _ => tracing::debug!(
                target: "roomkeeper::event_processor::handle_redaction",
                "Redaction {} has no target, dropping",
                event.id
            ),
        }
    }

    /// Fold an edit, reaction or redaction into its stored target.
    pub(crate) async fn apply_relation(&mut self, room_id: &str, relation: Relation, event: Event) {
        let Some(target_id) = relation.target_id().map(str::to_string) else {
            return;
        };

        if self.relation_seen(room_id, &event.id).await {
            tracing::debug!(
                target: "roomkeeper::event_processor::apply_relation",
                "Relation {} already applied, skipping",
                event.id
            );
            return;
        }

        let result = self
            .history
            .update(room_id, &target_id, &mut |target: &mut Event| {
                relation.apply(target, &event)
            })
            .await;

        let target = match result {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    target: "roomkeeper::event_processor::apply_relation",
                    "Target {} of {} not found in {}, dropping",
                    target_id,
                    event.id,
                    room_id
                );
                // A redaction is final even if we never saw its target
                if matches!(relation, Relation::Redaction { .. }) {
                    self.remember_relation(room_id, &event.id).await;
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::apply_relation",
                    "Failed to apply {} to {}: {}",
                    event.id,
                    target_id,
                    e
                );
                return;
            }
        };

        self.remember_relation(room_id, &event.id).await;

        if !self.shows_updates(room_id) {
            return;
        }
        match &relation {
            Relation::Edit { .. } | Relation::Reaction { .. } if target.is_redacted() => {}
            Relation::Edit { .. } => self.ui.add_edit(room_id, &target),
            Relation::Reaction { key, .. } => self.ui.add_reaction(room_id, &target, key),
            Relation::Redaction { .. } => self.ui.add_redaction(room_id, &target),
            Relation::Primary => {}
        }
    }

    /// Whether a relation event was already folded in. Store failures count
    /// as "not seen".
    pub(crate) async fn relation_seen(&self, room_id: &str, event_id: &str) -> bool {
        match self.history.is_processed(room_id, event_id).await {
            Ok(seen) => seen,
            Err(e) => {
                tracing::warn!(
                    target: "roomkeeper::event_processor::relation_seen",
                    "Failed to check processed relation {}: {}",
                    event_id,
                    e
                );
                false
            }
        }
    }

    pub(crate) async fn remember_relation(&self, room_id: &str, event_id: &str) {
        if let Err(e) = self.history.mark_processed(room_id, event_id).await {
            tracing::warn!(
                target: "roomkeeper::event_processor::remember_relation",
                "Failed to record processed relation {}: {}",
                event_id,
                e
            );
        }
    }
}
