//! Inbound turn handling with a bounded whole-turn retry loop.

use std::future::Future;

use sydney_client::history::GroupContext;
use sydney_client::{
    ConversationStore, MessageType, SydneyClient, SydneyError, TurnOptions, TurnOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::BotConfig;

/// One inbound message from the host framework.
#[derive(Debug, Default)]
pub struct Incoming {
    pub user_id: String,
    pub prompt: String,
    pub group: Option<GroupContext>,
    pub abort: CancellationToken,
}

/// Structured result handed back to the framework; never an error.
#[derive(Debug)]
pub enum TurnReply {
    Answer {
        /// Non-empty answer lines.
        lines: Vec<String>,
        suggested_responses: Option<serde_json::Value>,
        image_tag: Option<String>,
        apology_suppressed: bool,
    },
    Failure {
        message: String,
    },
}

/// Run one turn, retrying whole-turn failures up to the configured bound.
/// A `SessionInvalid` failure forces re-negotiation on the next attempt.
pub async fn handle_turn<S: ConversationStore>(
    client: &SydneyClient<S>,
    config: &BotConfig,
    incoming: Incoming,
) -> TurnReply {
    info!(user = %incoming.user_id, "handling turn");
    let result = run_with_retries(config.retries, |reset| {
        let options = TurnOptions {
            message_type: MessageType::SearchQuery,
            context: config.context.clone(),
            group: incoming.group.clone(),
            abort: incoming.abort.clone(),
            reset,
        };
        client.send_message(&incoming.user_id, &incoming.prompt, options)
    })
    .await;

    match result {
        Ok(outcome) => reply_from(outcome),
        Err(err) => {
            error!(error = %err, "turn failed after retries");
            TurnReply::Failure {
                // The service's own diagnostic beats a generic message.
                message: err.to_string(),
            }
        }
    }
}

/// Retry policy, split from the client call so it is testable. `attempt`
/// receives whether the next try should start a fresh thread.
pub(crate) async fn run_with_retries<F, Fut>(
    retries: u32,
    mut attempt: F,
) -> Result<TurnOutcome, SydneyError>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<TurnOutcome, SydneyError>>,
{
    let mut reset = false;
    let mut last_err = SydneyError::Service {
        value: "NoAttempt".into(),
        detail: "turn was never attempted".into(),
    };
    for round in 1..=retries.max(1) {
        match attempt(reset).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                reset = matches!(err, SydneyError::SessionInvalid(_));
                error!(round, error = %err, "turn attempt failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Whether a failure is worth another whole-turn attempt. Aborts are the
/// caller's decision and context overflow is deterministic.
fn is_retryable(err: &SydneyError) -> bool {
    !matches!(err, SydneyError::Aborted | SydneyError::ContextTooLong)
}

fn reply_from(outcome: TurnOutcome) -> TurnReply {
    let lines = outcome
        .response
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    TurnReply::Answer {
        lines,
        suggested_responses: outcome.details.suggested_responses,
        image_tag: outcome.details.image_tag,
        apology_suppressed: outcome.apology_suppressed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use sydney_client::{AssembledReply, SessionCredentials};

    fn outcome(text: &str) -> TurnOutcome {
        TurnOutcome {
            response: text.to_string(),
            details: AssembledReply {
                text: text.to_string(),
                ..AssembledReply::default()
            },
            apology_suppressed: false,
            credentials: SessionCredentials {
                conversation_signature: "sig".into(),
                conversation_id: "conv".into(),
                client_id: "client".into(),
            },
            message_id: "m".into(),
            invocation_id: 1,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(5, |_reset| {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(SydneyError::Timeout)
                } else {
                    Ok(outcome("hello"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap().response, "hello");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(3, |_reset| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(SydneyError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(SydneyError::Timeout)));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn session_invalid_forces_reset_on_next_attempt() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(5, |reset| {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                match n {
                    0 => {
                        assert!(!reset);
                        Err(SydneyError::SessionInvalid("expired".into()))
                    }
                    _ => {
                        assert!(reset);
                        Ok(outcome("fresh"))
                    }
                }
            }
        })
        .await;
        assert_eq!(result.unwrap().response, "fresh");
    }

    #[tokio::test]
    async fn abort_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(5, |_reset| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(SydneyError::Aborted) }
        })
        .await;
        assert!(matches!(result, Err(SydneyError::Aborted)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reply_lines_drop_blanks() {
        let reply = reply_from(outcome("first\n\n  \nsecond"));
        match reply {
            TurnReply::Answer { lines, .. } => assert_eq!(lines, vec!["first", "second"]),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
