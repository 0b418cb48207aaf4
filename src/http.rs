use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::config::HttpOptions;
use crate::error::MolidError;

pub fn build_client(timeout: Duration) -> Result<Client, MolidError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("molid/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| MolidError::Http(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| MolidError::Http(err.to_string()))
}

/// Sends a request, retrying throttling, gateway errors and connection failures
/// with exponential backoff. Non-retryable statuses are returned to the caller.
pub fn send_with_retries<F>(options: &HttpOptions, mut make_req: F) -> Result<Response, MolidError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < options.retries && is_retryable_status(status) {
                    debug!(status, attempt, "retrying request");
                    thread::sleep(backoff_delay(options.backoff, attempt));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < options.retries && is_retryable_error(&err) {
                    debug!(error = %err, attempt, "retrying request");
                    thread::sleep(backoff_delay(options.backoff, attempt));
                    attempt += 1;
                    continue;
                }
                return Err(MolidError::Http(err.to_string()));
            }
        }
    }
}

/// Maps a non-success response into `MolidError::Status`.
pub fn handle_status(response: Response) -> Result<Response, MolidError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .ok()
        .map(|text| text.chars().take(200).collect::<String>())
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "request failed".to_string());
    Err(MolidError::Status { status, message })
}

pub fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(700);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(700));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2800));
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }
}
