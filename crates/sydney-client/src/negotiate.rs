//! Session negotiation: mints conversation credentials over HTTP.
//!
//! The create endpoint occasionally answers 200 with an empty body; that is
//! transient and retried on a fixed delay. Everything else (non-2xx,
//! unparsable body, explicit rejection) is a credential problem and fails
//! immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{Result, SydneyError};

/// Bounded retries for 200-with-empty-body responses.
const EMPTY_BODY_RETRIES: u32 = 10;
/// Delay between empty-body retries.
const RETRY_DELAY: Duration = Duration::from_millis(400);

/// Credentials minted per logical conversation and reused across turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub conversation_signature: String,
    pub conversation_id: String,
    pub client_id: String,
}

/// Headers shared by the create request and the socket upgrade.
pub(crate) fn request_headers(auth_cookie: Option<&str>, client_ip: &str) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("accept", "application/json".to_string()),
        (
            "accept-language",
            "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6".to_string(),
        ),
        ("content-type", "application/json".to_string()),
        ("sec-fetch-dest", "empty".to_string()),
        ("sec-fetch-mode", "cors".to_string()),
        ("sec-fetch-site", "same-origin".to_string()),
        ("x-ms-client-request-id", uuid::Uuid::new_v4().to_string()),
        (
            "x-ms-useragent",
            "azsdk-js-api-client-factory/1.0.0-beta.1 core-rest-pipeline/1.10.3 OS/macOS".to_string(),
        ),
        (
            "referer",
            "https://www.bing.com/search?q=Bing+AI&showconv=1&FORM=hpcodx".to_string(),
        ),
        ("x-forwarded-for", client_ip.to_string()),
    ];
    if let Some(cookie) = auth_cookie {
        headers.push(("cookie", cookie.to_string()));
    }
    headers
}

/// Mint conversation credentials from `{host}/turing/conversation/create`.
pub async fn negotiate(
    http: &reqwest::Client,
    host: &str,
    auth_cookie: Option<&str>,
    client_ip: &str,
) -> Result<SessionCredentials> {
    let url = format!("{host}/turing/conversation/create");
    let headers = request_headers(auth_cookie, client_ip);
    debug!(%url, "creating conversation");

    negotiate_with(
        || async {
            let mut request = http.get(&url);
            for (name, value) in &headers {
                request = request.header(*name, value);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SydneyError::Network(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| SydneyError::Network(e.to_string()))?;
            Ok((status, body))
        },
        RETRY_DELAY,
    )
    .await
}

/// Retry policy + response classification, split from the transport so the
/// bounded-retry behavior is testable.
pub(crate) async fn negotiate_with<F, Fut>(
    mut fetch: F,
    retry_delay: Duration,
) -> Result<SessionCredentials>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(u16, String)>>,
{
    let (mut status, mut body) = fetch().await?;
    let mut retries = EMPTY_BODY_RETRIES;
    while retries > 0 && status == 200 && body.is_empty() {
        tokio::time::sleep(retry_delay).await;
        (status, body) = fetch().await?;
        retries -= 1;
    }

    if status != 200 {
        error!(status, body = %body, "conversation create rejected");
        return Err(SydneyError::Negotiation(format!(
            "status code {status}: {body}"
        )));
    }

    let json: serde_json::Value = serde_json::from_str(&body)
        .map_err(|_| SydneyError::Negotiation(format!("unparsable response: {body}")))?;

    if json["result"]["value"] == "UnauthorizedRequest" {
        return Err(SydneyError::Negotiation(format!(
            "UnauthorizedRequest: {}",
            json["result"]["message"].as_str().unwrap_or_default()
        )));
    }

    match (
        json["conversationSignature"].as_str(),
        json["conversationId"].as_str(),
        json["clientId"].as_str(),
    ) {
        (Some(signature), Some(id), Some(client)) => Ok(SessionCredentials {
            conversation_signature: signature.to_string(),
            conversation_id: id.to_string(),
            client_id: client.to_string(),
        }),
        _ => {
            let value = json["result"]["value"].as_str();
            let message = json["result"]["message"].as_str().unwrap_or_default();
            Err(SydneyError::Negotiation(match value {
                Some(value) => format!("{value}: {message}"),
                None => format!("unexpected response: {json}"),
            }))
        }
    }
}
