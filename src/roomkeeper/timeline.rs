use super::Roomkeeper;
use super::error::Result;
use super::event_processor::WorkerCommand;
use super::events::Event;

impl Roomkeeper {
    /// Page backward through a room's timeline. Serves from the local cache
    /// first; once the cache is exhausted, the next page is fetched from the
    /// server starting at the room's pagination token and stored.
    pub async fn get_history(&self, room_id: &str, limit: usize) -> Result<Vec<Event>> {
        let page = self
            .request(|reply| WorkerCommand::LoadHistory {
                room_id: room_id.to_string(),
                limit,
                reply,
            })
            .await??;

        if !page.events.is_empty() {
            tracing::debug!(
                target: "roomkeeper::timeline::get_history",
                "Loaded {} cached events for {}",
                page.events.len(),
                room_id
            );
            return Ok(page.events);
        }

        let fetched = self
            .transport
            .messages(room_id, page.prev_batch.as_deref(), limit)
            .await?;
        tracing::debug!(
            target: "roomkeeper::timeline::get_history",
            "Fetched {} events for {} from the server",
            fetched.chunk.len(),
            room_id
        );

        self.request(|reply| WorkerCommand::ApplyBackfill {
            room_id: room_id.to_string(),
            page: fetched,
            reply,
        })
        .await
    }

    /// Look an event up in the local cache, falling back to the server.
    /// Events fetched this way are not stored.
    pub async fn get_event(&self, room_id: &str, event_id: &str) -> Result<Event> {
        match self.history.get(room_id, event_id).await {
            Ok(event) => return Ok(event),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::debug!(
                target: "roomkeeper::timeline::get_event",
                "Failed to get event {} from local cache: {}",
                event_id,
                e
            ),
        }
        Ok(self.transport.get_event(room_id, event_id).await?)
    }
}
