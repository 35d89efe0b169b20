//! Shared vendor HTTP plumbing

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::trait_::ConnectorError;

pub const USER_AGENT: &str = concat!("integrations/", env!("CARGO_PKG_VERSION"));

/// Builds the client shared by every connector. The per-request timeout is
/// a backstop; the service applies its own deadline around each call.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ConnectorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ConnectorError::configuration(format!("failed to build HTTP client: {}", e)))
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

fn rate_limit_exhausted(response: &Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|h| h.to_str().ok())
        .is_some_and(|remaining| remaining.trim() == "0")
}

/// Passes successful responses through and classifies everything else.
pub async fn check_status(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limit_exhausted(&response))
    {
        return Err(ConnectorError::RateLimitError {
            retry_after: retry_after(&response),
        });
    }

    let body = response.text().await.ok().filter(|b| !b.is_empty());
    Err(ConnectorError::from_status(status.as_u16(), body))
}

/// Sends the request, checks the status and decodes a JSON body.
pub async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ConnectorError> {
    let response = check_status(request.send().await?).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ConnectorError::malformed(e.to_string()))
}

/// Sends the request and only checks the status.
pub async fn send_empty(request: reqwest::RequestBuilder) -> Result<(), ConnectorError> {
    check_status(request.send().await?).await?;
    Ok(())
}

/// Joins a configured base URL and an absolute API path.
pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            endpoint("https://api.github.com/", "/app/installations/1"),
            "https://api.github.com/app/installations/1"
        );
        assert_eq!(endpoint("http://127.0.0.1:8080", "/x"), "http://127.0.0.1:8080/x");
    }
}
