//! Job status rows.

use rusqlite::{OptionalExtension, params};
use std::str::FromStr;

use super::Database;
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::status::{JobStatus, STATUS_PARTITION, StatusStore};

impl Database {
    fn read_status(conn: &rusqlite::Connection, job_id: &str) -> ServiceResult<Option<JobStatus>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM job_status WHERE partition_key = ?1 AND job_id = ?2",
                params![STATUS_PARTITION, job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        raw.map(|s| {
            JobStatus::from_str(&s).map_err(|_| ServiceError::Internal {
                message: format!("Unknown status {s:?} stored for job {job_id}"),
            })
        })
        .transpose()
    }
}

impl StatusStore for Database {
    fn create(&self, job_id: &str) -> ServiceResult<()> {
        let conn = self.conn();

        if let Some(current) = Self::read_status(&conn, job_id)?
            && !current.is_terminal()
        {
            return Err(ServiceError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current,
                to: JobStatus::Queued,
            });
        }

        conn.execute(
            "INSERT INTO job_status (partition_key, job_id, status, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(partition_key, job_id) DO UPDATE
             SET status = excluded.status, updated_at = excluded.updated_at",
            params![STATUS_PARTITION, job_id, JobStatus::Queued.as_str()],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    fn get(&self, job_id: &str) -> ServiceResult<Option<JobStatus>> {
        let conn = self.conn();
        Self::read_status(&conn, job_id)
    }

    fn transition(&self, job_id: &str, status: JobStatus) -> ServiceResult<()> {
        let conn = self.conn();

        let current = Self::read_status(&conn, job_id)?.ok_or_else(|| ServiceError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        if !current.can_transition_to(status) {
            return Err(ServiceError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current,
                to: status,
            });
        }

        conn.execute(
            "UPDATE job_status SET status = ?1, updated_at = datetime('now')
             WHERE partition_key = ?2 AND job_id = ?3",
            params![status.as_str(), STATUS_PARTITION, job_id],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    fn delete(&self, job_id: &str) -> ServiceResult<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM job_status WHERE partition_key = ?1 AND job_id = ?2",
            params![STATUS_PARTITION, job_id],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get("job-1").unwrap(), None);

        db.create("job-1").unwrap();
        assert_eq!(db.get("job-1").unwrap(), Some(JobStatus::Queued));

        db.transition("job-1", JobStatus::IngestionStarted).unwrap();
        db.transition("job-1", JobStatus::IngestionStarted).unwrap();
        db.transition("job-1", JobStatus::GraphragStarted).unwrap();

        let err = db.transition("job-1", JobStatus::Queued).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: JobStatus::GraphragStarted,
                to: JobStatus::Queued,
                ..
            }
        ));

        db.transition("job-1", JobStatus::Failed).unwrap();
        assert_eq!(db.get("job-1").unwrap(), Some(JobStatus::Failed));

        db.delete("job-1").unwrap();
        db.delete("job-1").unwrap();
        assert_eq!(db.get("job-1").unwrap(), None);
    }

    #[test]
    fn test_transition_requires_existing_row() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.transition("missing", JobStatus::Completed),
            Err(ServiceError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_create_resets_terminal_row() {
        let db = Database::open_in_memory().unwrap();
        db.create("job-2").unwrap();
        db.transition("job-2", JobStatus::Completed).unwrap();

        db.create("job-2").unwrap();
        assert_eq!(db.get("job-2").unwrap(), Some(JobStatus::Queued));
    }

    #[test]
    fn test_create_rejects_live_row() {
        let db = Database::open_in_memory().unwrap();
        db.create("job-3").unwrap();
        db.transition("job-3", JobStatus::GraphragStarted).unwrap();

        let result = db.create("job-3");
        assert!(matches!(
            result,
            Err(ServiceError::InvalidTransition {
                from: JobStatus::GraphragStarted,
                to: JobStatus::Queued,
                ..
            })
        ));
        assert_eq!(db.get("job-3").unwrap(), Some(JobStatus::GraphragStarted));

        // A queued row is live too
        db.create("job-4").unwrap();
        assert!(db.create("job-4").is_err());
        assert_eq!(db.get("job-4").unwrap(), Some(JobStatus::Queued));
    }
}
