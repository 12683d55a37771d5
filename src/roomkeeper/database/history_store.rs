use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Database, processed_relations};
use crate::roomkeeper::events::Event;
use crate::roomkeeper::history::{EventMutation, HistoryError, HistoryStore, SyncState};
use crate::roomkeeper::rooms::Room;

type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug)]
struct StoredEventRow {
    id: i64,
    position: i64,
    event: Event,
}

impl<'r, R> sqlx::FromRow<'r, R> for StoredEventRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let position: i64 = row.try_get("position")?;

        let data: String = row.try_get("data")?;
        let event = serde_json::from_str(&data).map_err(|e| sqlx::Error::ColumnDecode {
            index: "data".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            id,
            position,
            event,
        })
    }
}

/// SQLite-backed [`HistoryStore`].
///
/// Each room's timeline is ordered by an integer `position`. Appends take
/// positions above the current maximum; prepends take positions below the
/// current minimum, so backfilled pages never disturb existing order.
pub struct SqliteHistoryStore {
    database: Database,
    /// Lowest position handed out by `load` so far, per room.
    load_cursors: DashMap<String, i64>,
    closed: AtomicBool,
}

impl SqliteHistoryStore {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            load_cursors: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HistoryError::Closed);
        }
        Ok(())
    }

    async fn find_row(&self, room_id: &str, event_id: &str) -> Result<Option<StoredEventRow>> {
        let row = sqlx::query_as::<_, StoredEventRow>(
            "SELECT id, position, data FROM events WHERE room_id = ? AND event_id = ?",
        )
        .bind(room_id)
        .bind(event_id)
        .fetch_optional(&self.database.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, room_id: &str, events: Vec<Event>) -> Result<Vec<Event>> {
        self.ensure_open()?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.database.pool.begin().await?;

        let (max_position,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(position) FROM events WHERE room_id = ?")
                .bind(room_id)
                .fetch_one(&mut *tx)
                .await?;
        let mut next_position = max_position.map_or(0, |max| max + 1);

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO events
                 (room_id, event_id, position, sender, event_type, origin_server_ts, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(room_id)
            .bind(&event.id)
            .bind(next_position)
            .bind(&event.sender)
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(serde_json::to_string(&event)?)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tracing::debug!(
                    target: "roomkeeper::history::append",
                    "Skipping duplicate event {} in room {}",
                    event.id,
                    room_id
                );
                continue;
            }
            next_position += 1;
            stored.push(event);
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn prepend(&self, room_id: &str, events: Vec<Event>) -> Result<Vec<Event>> {
        self.ensure_open()?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.database.pool.begin().await?;

        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if !seen.insert(event.id.clone()) {
                continue;
            }
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM events WHERE room_id = ? AND event_id = ?)",
            )
            .bind(room_id)
            .bind(&event.id)
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                fresh.push(event);
            }
        }

        if fresh.is_empty() {
            tx.commit().await?;
            return Ok(fresh);
        }

        let (min_position,): (Option<i64>,) =
            sqlx::query_as("SELECT MIN(position) FROM events WHERE room_id = ?")
                .bind(room_id)
                .fetch_one(&mut *tx)
                .await?;
        let first_position = min_position.unwrap_or(0) - fresh.len() as i64;

        for (offset, event) in fresh.iter().enumerate() {
            sqlx::query(
                "INSERT INTO events
                 (room_id, event_id, position, sender, event_type, origin_server_ts, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(room_id)
            .bind(&event.id)
            .bind(first_position + offset as i64)
            .bind(&event.sender)
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(serde_json::to_string(event)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        // The caller already shows the prepended page, so the next `load`
        // continues below it.
        self.load_cursors
            .insert(room_id.to_string(), first_position);

        Ok(fresh)
    }

    async fn update(
        &self,
        room_id: &str,
        event_id: &str,
        mutate: EventMutation<'_>,
    ) -> Result<Event> {
        self.ensure_open()?;

        let row = self
            .find_row(room_id, event_id)
            .await?
            .ok_or_else(|| HistoryError::not_found(room_id, event_id))?;

        let mut event = row.event;
        mutate(&mut event);

        sqlx::query(
            "UPDATE events
             SET event_id = ?, sender = ?, event_type = ?, origin_server_ts = ?, data = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&event.id)
        .bind(&event.sender)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(serde_json::to_string(&event)?)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(row.id)
        .execute(&self.database.pool)
        .await?;

        Ok(event)
    }

    async fn get(&self, room_id: &str, event_id: &str) -> Result<Event> {
        self.ensure_open()?;
        self.find_row(room_id, event_id)
            .await?
            .map(|row| row.event)
            .ok_or_else(|| HistoryError::not_found(room_id, event_id))
    }

    async fn remove(&self, room_id: &str, event_id: &str) -> Result<()> {
        self.ensure_open()?;
        sqlx::query("DELETE FROM events WHERE room_id = ? AND event_id = ?")
            .bind(room_id)
            .bind(event_id)
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }

    async fn load(&self, room_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.ensure_open()?;

        let before = self
            .load_cursors
            .get(room_id)
            .map(|cursor| *cursor.value())
            .unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, StoredEventRow>(
            "SELECT id, position, data FROM events
             WHERE room_id = ? AND position < ?
             ORDER BY position DESC
             LIMIT ?",
        )
        .bind(room_id)
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.database.pool)
        .await?;

        let Some(oldest) = rows.last() else {
            return Ok(Vec::new());
        };
        self.load_cursors
            .insert(room_id.to_string(), oldest.position);

        Ok(rows.into_iter().rev().map(|row| row.event).collect())
    }

    async fn rewind(&self, room_id: &str) {
        self.load_cursors.remove(room_id);
    }

    async fn save_room(&self, room: &Room) -> Result<()> {
        self.ensure_open()?;
        room.save(&self.database).await?;
        Ok(())
    }

    async fn load_rooms(&self) -> Result<Vec<Room>> {
        self.ensure_open()?;
        Ok(Room::all(&self.database).await?)
    }

    async fn load_sync_state(&self) -> Result<SyncState> {
        self.ensure_open()?;
        Ok(SyncState::find(&self.database).await?)
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.ensure_open()?;
        state.save(&self.database).await?;
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        self.ensure_open()?;
        self.database.delete_all_data().await?;
        self.load_cursors.clear();
        Ok(())
    }

    async fn is_processed(&self, room_id: &str, event_id: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(processed_relations::exists(room_id, event_id, &self.database).await?)
    }

    async fn mark_processed(&self, room_id: &str, event_id: &str) -> Result<()> {
        self.ensure_open()?;
        processed_relations::create(room_id, event_id, &self.database).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(target: "roomkeeper::history::close", "Closing history store");
        self.database.pool.close().await;
        Ok(())
    }
}
