//! Shared plumbing for the HTTP collaborators.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use crate::error::{ExternalServiceError, ServiceResult};

/// Client with a call-level timeout, so a hung peer cannot stall a worker.
pub fn build_client(
    service: &'static str,
    base_url: &str,
    timeout: Duration,
) -> ServiceResult<Client> {
    Client::builder().timeout(timeout).build().map_err(|e| {
        ExternalServiceError::Connection {
            service,
            url: base_url.to_string(),
            source: e,
        }
        .into()
    })
}

pub fn connection_error(
    service: &'static str,
    url: &str,
) -> impl FnOnce(reqwest::Error) -> ExternalServiceError {
    let url = url.to_string();
    move |source| ExternalServiceError::Connection {
        service,
        url,
        source,
    }
}

/// Pass successful responses through; turn 429 into `RateLimited` and
/// anything else into `Status` carrying the response body.
pub async fn check_status(
    service: &'static str,
    response: Response,
) -> Result<Response, ExternalServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ExternalServiceError::RateLimited {
            service,
            retry_after: retry_after(&response),
        });
    }
    let message = response.text().await.unwrap_or_default();
    Err(ExternalServiceError::Status {
        service,
        status: status.as_u16(),
        message,
    })
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
