use super::{Database, DatabaseError};
use crate::roomkeeper::rooms::Room;

impl Room {
    /// Insert or replace the persisted snapshot of this room.
    pub(crate) async fn save(&self, database: &Database) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(self)?;
        sqlx::query(
            "INSERT INTO rooms (room_id, data, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(room_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&self.id)
        .bind(data)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&database.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn all(database: &Database) -> Result<Vec<Room>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM rooms ORDER BY room_id")
            .fetch_all(&database.pool)
            .await?;

        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).map_err(DatabaseError::from))
            .collect()
    }
}
