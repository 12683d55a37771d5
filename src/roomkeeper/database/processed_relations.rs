//! Relation events (edits, reactions, redactions) that were already folded
//! into a stored target. Replayed relations are skipped so reaction counts
//! and edit histories don't grow on a second delivery.

use super::{Database, DatabaseError};

/// Records that a relation event was applied.
pub(crate) async fn create(
    room_id: &str,
    event_id: &str,
    database: &Database,
) -> Result<(), DatabaseError> {
    sqlx::query("INSERT OR IGNORE INTO processed_relations (room_id, event_id) VALUES (?, ?)")
        .bind(room_id)
        .bind(event_id)
        .execute(&database.pool)
        .await?;

    Ok(())
}

pub(crate) async fn exists(
    room_id: &str,
    event_id: &str,
    database: &Database,
) -> Result<bool, DatabaseError> {
    let result: Option<(bool,)> = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM processed_relations WHERE room_id = ? AND event_id = ?)",
    )
    .bind(room_id)
    .bind(event_id)
    .fetch_optional(&database.pool)
    .await?;

    Ok(result.map(|(exists,)| exists).unwrap_or(false))
}
