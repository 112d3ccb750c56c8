//! SQLite-backed work queue with visibility-timeout leases.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::Database;
use crate::error::{DatabaseError, QueueError, ServiceResult};
use crate::queue::{LeasedMessage, WorkQueue};

/// One named queue stored in the shared `queue_messages` table.
pub struct SqliteWorkQueue {
    db: Arc<Database>,
    name: String,
}

impl SqliteWorkQueue {
    pub fn new(db: Arc<Database>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    fn lease_lost(&self, message: &LeasedMessage) -> QueueError {
        QueueError::LeaseLost {
            queue: self.name.clone(),
            message_id: message.id.clone(),
        }
    }
}

fn deadline(now_ms: i64, timeout: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
}

impl WorkQueue for SqliteWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, body: &str) -> ServiceResult<String> {
        let conn = self.db.conn();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        conn.execute(
            "INSERT INTO queue_messages (id, queue, body, delivery_count, visible_at, inserted_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![id, self.name, body, now],
        )
        .map_err(DatabaseError::Query)?;

        Ok(id)
    }

    fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> ServiceResult<Vec<LeasedMessage>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        let now = Utc::now().timestamp_millis();
        let visible_at = deadline(now, visibility_timeout);
        let limit = i64::try_from(max_messages).unwrap_or(i64::MAX);

        let candidates: Vec<(String, String, u32, i64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, body, delivery_count, inserted_at FROM queue_messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY visible_at, inserted_at
                     LIMIT ?3",
                )
                .map_err(DatabaseError::Query)?;

            stmt.query_map(params![self.name, now, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(DatabaseError::Query)?
            .collect::<Result<_, _>>()
            .map_err(DatabaseError::Query)?
        };

        let mut leased = Vec::with_capacity(candidates.len());
        for (id, body, delivery_count, inserted_ms) in candidates {
            let lease_token = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_messages
                 SET delivery_count = delivery_count + 1, lease_token = ?1, visible_at = ?2
                 WHERE id = ?3",
                params![lease_token, visible_at, id],
            )
            .map_err(DatabaseError::Query)?;

            leased.push(LeasedMessage {
                id,
                body,
                delivery_count: delivery_count + 1,
                lease_token,
                inserted_at: DateTime::from_timestamp_millis(inserted_ms).unwrap_or_default(),
            });
        }

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(leased)
    }

    fn delete(&self, message: &LeasedMessage) -> ServiceResult<()> {
        let conn = self.db.conn();

        let deleted = conn
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND queue = ?2 AND lease_token = ?3",
                params![message.id, self.name, message.lease_token],
            )
            .map_err(DatabaseError::Query)?;
        if deleted > 0 {
            return Ok(());
        }

        // Nothing matched: either already gone (fine) or re-leased (not ours)
        let still_present: Option<String> = conn
            .query_row(
                "SELECT id FROM queue_messages WHERE id = ?1 AND queue = ?2",
                params![message.id, self.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        match still_present {
            Some(_) => Err(self.lease_lost(message).into()),
            None => Ok(()),
        }
    }

    fn renew_lease(
        &self,
        message: &LeasedMessage,
        visibility_timeout: Duration,
    ) -> ServiceResult<()> {
        let conn = self.db.conn();
        let visible_at = deadline(Utc::now().timestamp_millis(), visibility_timeout);

        let updated = conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?1
                 WHERE id = ?2 AND queue = ?3 AND lease_token = ?4",
                params![visible_at, message.id, self.name, message.lease_token],
            )
            .map_err(DatabaseError::Query)?;

        if updated == 0 {
            return Err(self.lease_lost(message).into());
        }
        Ok(())
    }

    fn approximate_len(&self) -> ServiceResult<u64> {
        let conn = self.db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;

    fn queue(name: &str) -> SqliteWorkQueue {
        SqliteWorkQueue::new(Arc::new(Database::open_in_memory().unwrap()), name)
    }

    const LONG: Duration = Duration::from_secs(300);

    #[test]
    fn test_leased_messages_are_invisible() {
        let q = queue("ingestion");
        q.enqueue("a").unwrap();
        q.enqueue("b").unwrap();

        let first = q.receive(32, LONG).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|m| m.delivery_count == 1));

        assert!(q.receive(32, LONG).unwrap().is_empty());
        assert_eq!(q.approximate_len().unwrap(), 2);
    }

    #[test]
    fn test_expired_lease_redelivers_with_higher_count() {
        let q = queue("ingestion");
        q.enqueue("payload").unwrap();

        let first = q.receive(1, Duration::ZERO).unwrap();
        let second = q.receive(1, Duration::ZERO).unwrap();

        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].delivery_count, 2);
        assert_ne!(first[0].lease_token, second[0].lease_token);
    }

    #[test]
    fn test_stale_lease_cannot_delete_or_renew() {
        let q = queue("indexing");
        q.enqueue("job").unwrap();

        let stale = q.receive(1, Duration::ZERO).unwrap().remove(0);
        let current = q.receive(1, LONG).unwrap().remove(0);

        assert!(matches!(
            q.delete(&stale),
            Err(ServiceError::Queue(QueueError::LeaseLost { .. }))
        ));
        assert!(q.renew_lease(&stale, LONG).is_err());

        q.renew_lease(&current, LONG).unwrap();
        q.delete(&current).unwrap();
        assert_eq!(q.approximate_len().unwrap(), 0);

        // Deleting again is a no-op
        q.delete(&current).unwrap();
    }

    #[test]
    fn test_queues_are_isolated_and_batches_bounded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let uploads = SqliteWorkQueue::new(db.clone(), "ingestion");
        let jobs = SqliteWorkQueue::new(db, "indexing");

        for i in 0..5 {
            uploads.enqueue(&format!("m{i}")).unwrap();
        }
        jobs.enqueue("job").unwrap();

        assert_eq!(uploads.receive(3, LONG).unwrap().len(), 3);
        assert_eq!(uploads.receive(32, LONG).unwrap().len(), 2);

        let job = jobs.receive(32, LONG).unwrap();
        assert_eq!(job.len(), 1);
        assert_eq!(job[0].body, "job");
    }
}
