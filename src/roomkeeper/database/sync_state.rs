use super::{Database, DatabaseError};
use crate::roomkeeper::history::SyncState;
use crate::roomkeeper::preferences::Preferences;

impl SyncState {
    pub(crate) async fn find(database: &Database) -> Result<SyncState, DatabaseError> {
        let row: Option<(Option<String>, bool, String)> = sqlx::query_as(
            "SELECT next_batch, initial_sync_done, preferences FROM sync_state WHERE id = 1",
        )
        .fetch_optional(&database.pool)
        .await?;

        match row {
            Some((next_batch, initial_sync_done, preferences)) => Ok(SyncState {
                next_batch,
                initial_sync_done,
                preferences: serde_json::from_str::<Preferences>(&preferences)?,
            }),
            None => Ok(SyncState::default()),
        }
    }

    pub(crate) async fn save(&self, database: &Database) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO sync_state (id, next_batch, initial_sync_done, preferences, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                next_batch = excluded.next_batch,
                initial_sync_done = excluded.initial_sync_done,
                preferences = excluded.preferences,
                updated_at = excluded.updated_at",
        )
        .bind(&self.next_batch)
        .bind(self.initial_sync_done)
        .bind(serde_json::to_string(&self.preferences)?)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&database.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_row_yields_default() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("test.db")).await.unwrap();

        assert_eq!(SyncState::find(&db).await.unwrap(), SyncState::default());
    }

    #[tokio::test]
    async fn test_save_overwrites_single_row() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("test.db")).await.unwrap();

        let mut state = SyncState {
            next_batch: Some("s1".to_string()),
            initial_sync_done: false,
            preferences: Preferences::default(),
        };
        state.save(&db).await.unwrap();

        state.next_batch = Some("s2".to_string());
        state.initial_sync_done = true;
        state.preferences.disable_notifications = true;
        state.save(&db).await.unwrap();

        let found = SyncState::find(&db).await.unwrap();
        assert_eq!(found, state);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_state")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
