//! The settle-exactly-once race for a single in-flight turn.
//!
//! Four triggers compete: frame arrival, the overall deadline, the
//! first-frame deadline, and external abort. The race lives in one task and
//! one `select!` loop, so the first trigger to fire is the only writer; the
//! losing timers are dropped with the loop. Partial text always beats an
//! error: a deadline or abort with a non-empty buffer resolves successfully.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::reconstruct::{AssembledReply, FrameOutcome, Reconstruction, Settlement};
use crate::{Result, SydneyError};

/// Deadlines for one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Overall bound on the whole exchange.
    pub timeout: Duration,
    /// Bound on the service producing its first text.
    pub first_frame_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            first_frame_timeout: Duration::from_secs(40),
        }
    }
}

/// How the exchange settled, plus any rate-limit hint seen along the way.
#[derive(Debug)]
pub struct ExchangeOutcome {
    pub result: Result<AssembledReply>,
    /// New user-turn budget discovered from a throttling frame, to be
    /// carried on the per-user record.
    pub turn_budget_hint: Option<u32>,
}

/// Drive the exchange until exactly one trigger settles it. The caller owns
/// session teardown and must close the hub before consuming the outcome.
pub async fn drive(
    config: &ExchangeConfig,
    frames: &mut mpsc::Receiver<serde_json::Value>,
    abort: &CancellationToken,
) -> ExchangeOutcome {
    let mut engine = Reconstruction::new();
    let mut turn_budget_hint = None;

    let overall = tokio::time::sleep(config.timeout);
    tokio::pin!(overall);
    let first_frame = tokio::time::sleep(config.first_frame_timeout);
    tokio::pin!(first_frame);
    let mut first_frame_armed = true;

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => match engine.apply(&frame) {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Throttled { max_user_turns } => {
                        debug!(max_user_turns, "throttling hint received");
                        turn_budget_hint = Some(max_user_turns);
                    }
                    FrameOutcome::Settled(Settlement::Reply(reply)) => break Ok(reply),
                    FrameOutcome::Settled(Settlement::Failed(err)) => break Err(err),
                },
                // Transport gone without a terminal frame.
                None => {
                    break if engine.has_text() {
                        Ok(engine.partial_reply())
                    } else {
                        Err(SydneyError::Network(
                            "connection closed before a terminal frame".into(),
                        ))
                    };
                }
            },
            _ = &mut overall => {
                debug!("overall deadline elapsed");
                break if engine.has_text() {
                    Ok(engine.partial_reply())
                } else {
                    Err(SydneyError::Timeout)
                };
            }
            _ = &mut first_frame, if first_frame_armed => {
                first_frame_armed = false;
                if !engine.has_text() {
                    break Err(SydneyError::Unresponsive);
                }
                // Text is already flowing; the trigger is moot.
            }
            _ = abort.cancelled() => {
                debug!("exchange aborted");
                break if engine.has_text() {
                    Ok(engine.partial_reply())
                } else {
                    Err(SydneyError::Aborted)
                };
            }
        }
    };

    ExchangeOutcome {
        result,
        turn_budget_hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_frame(text: &str) -> serde_json::Value {
        json!({
            "type": 1,
            "arguments": [{ "messages": [{ "author": "bot", "text": text }] }]
        })
    }

    fn terminal_frame(text: &str) -> serde_json::Value {
        json!({
            "type": 2,
            "item": { "messages": [{ "author": "bot", "text": text }] }
        })
    }

    fn config(timeout_secs: u64, first_secs: u64) -> ExchangeConfig {
        ExchangeConfig {
            timeout: Duration::from_secs(timeout_secs),
            first_frame_timeout: Duration::from_secs(first_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn data_arrival_wins_and_settles_with_the_answer() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(update_frame("Hello")).await.unwrap();
            tx.send(terminal_frame("Hello, world")).await.unwrap();
        });

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert_eq!(outcome.result.unwrap().text, "Hello, world");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_any_frame_rejects_with_aborted() {
        let (_tx, mut rx) = mpsc::channel::<serde_json::Value>(8);
        let abort = CancellationToken::new();
        abort.cancel();

        let outcome = drive(&config(120, 40), &mut rx, &abort).await;
        assert!(matches!(outcome.result, Err(SydneyError::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_with_partial_text_resolves_the_partial() {
        let (tx, mut rx) = mpsc::channel(8);
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tx.send(update_frame("partial so far")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = drive(&config(120, 40), &mut rx, &abort).await;
        assert_eq!(outcome.result.unwrap().text, "partial so far");
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_with_text_never_rejects() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(update_frame("slow answer")).await.unwrap();
            // Never send a terminal frame; hold the channel open past the
            // deadline.
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert_eq!(outcome.result.unwrap().text, "slow answer");
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_without_text_rejects() {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            drop(tx);
        });

        // First-frame bound longer than the overall bound, so the overall
        // deadline is the one that fires.
        let outcome = drive(&config(120, 300), &mut rx, &CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(SydneyError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_timeout_rejects_when_silent() {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            drop(tx);
        });

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(SydneyError::Unresponsive)));
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_timeout_is_moot_once_text_arrived() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(update_frame("early text")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(50)).await;
            tx.send(terminal_frame("early text, finished")).await.unwrap();
        });

        // The first-frame deadline (40s) fires while the feeder sleeps, but
        // text exists, so the exchange keeps going to the terminal frame.
        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert_eq!(outcome.result.unwrap().text, "early text, finished");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_with_partial_resolves_partial() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(update_frame("cut short")).await.unwrap();
        });

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert_eq!(outcome.result.unwrap().text, "cut short");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_without_text_is_a_network_error() {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(8);
        drop(tx);

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(SydneyError::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_hint_is_reported_alongside_the_answer() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(json!({
                "type": 1,
                "arguments": [{ "throttling": { "maxNumUserMessagesInConversation": 7 } }]
            }))
            .await
            .unwrap();
            tx.send(terminal_frame("done")).await.unwrap();
        });

        let outcome = drive(&config(120, 40), &mut rx, &CancellationToken::new()).await;
        assert_eq!(outcome.turn_budget_hint, Some(7));
        assert_eq!(outcome.result.unwrap().text, "done");
    }
}
