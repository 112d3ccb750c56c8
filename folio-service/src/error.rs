use std::time::Duration;

use thiserror::Error;

use crate::status::JobStatus;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Queue error")]
    Queue(#[from] QueueError),

    #[error("Object storage error")]
    Storage(#[from] StorageError),

    #[error("Page rendering failed")]
    Render(#[from] RenderError),

    #[error("{0}")]
    External(#[from] ExternalServiceError),

    #[error("Invalid message")]
    Message(#[from] MessageError),

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} did not reach a terminal status within {timeout:?}")]
    JobTimedOut { job_id: String, timeout: Duration },

    #[error("{operation} still rate limited after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },
}

/// Work queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// The lease token no longer matches: the message was redelivered to
    /// another receiver after our visibility timeout expired.
    #[error("Lease lost for message {message_id} on queue {queue}")]
    LeaseLost { queue: String, message_id: String },
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {container}/{key}")]
    NotFound { container: String, key: String },

    #[error("Invalid object name: {name}")]
    InvalidName { name: String },

    #[error("Cannot resolve object location from {url}")]
    InvalidLocation { url: String },

    #[error("IO error at {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// PDF splitting and rasterization errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to load PDFium library: {message}")]
    Library { message: String },

    #[error("PDF operation failed on page {page}: {message}")]
    Pdf { page: u32, message: String },

    #[error("Page {page} is out of range (document has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: u32 },

    #[error("Image encoding failed")]
    Image(#[source] image::ImageError),

    #[error("Rendering task panicked")]
    Task(#[source] tokio::task::JoinError),

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

/// Errors from HTTP collaborators (layout extraction, captioning, indexer, graph builder)
#[derive(Error, Debug)]
pub enum ExternalServiceError {
    #[error("Connection failed to {service} at {url}")]
    Connection {
        service: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} is rate limiting requests")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("{service} request failed (status {status}): {message}")]
    Status {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {service}: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },

    #[error("{service} operation failed: {message}")]
    OperationFailed {
        service: &'static str,
        message: String,
    },
}

/// Queue message payload errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to decode message body")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode message body")]
    Encode(#[source] serde_json::Error),

    #[error("Filename {filename:?} contains the reserved page separator \"___\"")]
    ReservedSeparator { filename: String },

    #[error("Job id {job_id} does not match container {container_name}")]
    JobIdMismatch {
        job_id: String,
        container_name: String,
    },
}

impl ServiceError {
    /// True for the "too many requests" class handled by the shared backoff policy.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            ServiceError::External(ExternalServiceError::RateLimited { .. })
        )
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::External(ExternalServiceError::RateLimited { retry_after, .. }) => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and its whole `source()` chain on one line.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_chain_includes_sources() {
        let error = ServiceError::Storage(StorageError::Io {
            path: "/tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });

        assert_eq!(
            format_error_chain(&error),
            "Object storage error: IO error at /tmp/x: denied"
        );
    }

    #[test]
    fn test_rate_limited_classification() {
        let limited: ServiceError = ExternalServiceError::RateLimited {
            service: "layout",
            retry_after: Some(Duration::from_secs(7)),
        }
        .into();
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));

        let failed: ServiceError = ExternalServiceError::Status {
            service: "layout",
            status: 500,
            message: "boom".to_string(),
        }
        .into();
        assert!(!failed.is_rate_limited());
        assert_eq!(failed.retry_after(), None);
    }
}
