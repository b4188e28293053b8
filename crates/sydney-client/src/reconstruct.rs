//! Stream reconstruction: assembles the final answer from out-of-order,
//! duplicated, and restarted protocol frames.
//!
//! The service re-sends the full text of the fragment it is working on with
//! every progress frame, and may abandon a fragment and restart a new one
//! mid-answer. State is therefore an ordered fragment list indexed by a
//! cursor: a frame that continues the current fragment replaces it, a frame
//! that does not opens a new slot. Apology and stop-token signals can arrive
//! on either frame type and fold into a single settle-exactly-once contract.

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{frame_type, FRAME_FINAL, FRAME_UPDATE, STOP_TOKEN};
use crate::SydneyError;

/// The assembled answer for one turn.
#[derive(Debug, Clone, Default)]
pub struct AssembledReply {
    pub text: String,
    pub adaptive_cards: Option<Value>,
    pub suggested_responses: Option<Value>,
    pub image_tag: Option<String>,
    /// The service declined to answer and produced no text of its own.
    pub apology: bool,
}

/// What a frame did to the exchange.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Keep streaming.
    Continue,
    /// Rate-limit hint; the caller should carry the new user-turn budget on
    /// the per-user record. Reconstruction state is untouched.
    Throttled { max_user_turns: u32 },
    /// The exchange is over; the caller must cancel both timeouts and tear
    /// down the socket session before resolving.
    Settled(Settlement),
}

/// Exactly one of these results from a settled exchange.
#[derive(Debug)]
pub enum Settlement {
    Reply(AssembledReply),
    Failed(SydneyError),
}

/// Frame-driven reconstruction state machine.
#[derive(Debug)]
pub struct Reconstruction {
    fragments: Vec<String>,
    cursor: usize,
    apology: bool,
    stop_token_found: bool,
    adaptive_cards: Option<Value>,
    suggested_responses: Option<Value>,
}

impl Default for Reconstruction {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconstruction {
    pub fn new() -> Self {
        Self {
            fragments: vec![String::new()],
            cursor: 0,
            apology: false,
            stop_token_found: false,
            adaptive_cards: None,
            suggested_responses: None,
        }
    }

    /// Whether any answer text has been produced yet.
    pub fn has_text(&self) -> bool {
        !self.fragments[0].is_empty()
    }

    /// All fragments joined into the answer so far.
    pub fn text(&self) -> String {
        self.fragments.concat()
    }

    /// Snapshot of the partial answer, used when a timeout/abort settles the
    /// turn with whatever arrived.
    pub fn partial_reply(&self) -> AssembledReply {
        AssembledReply {
            text: self.text(),
            adaptive_cards: self.adaptive_cards.clone(),
            suggested_responses: self.suggested_responses.clone(),
            image_tag: None,
            apology: self.apology,
        }
    }

    /// Feed one inbound frame, dispatching on its `type` tag.
    pub fn apply(&mut self, frame: &Value) -> FrameOutcome {
        match frame_type(frame) {
            Some(FRAME_UPDATE) => self.apply_update(frame),
            Some(FRAME_FINAL) => self.apply_final(frame),
            _ => FrameOutcome::Continue,
        }
    }

    /// Progress frame (`type: 1`).
    fn apply_update(&mut self, frame: &Value) -> FrameOutcome {
        if self.stop_token_found || self.apology {
            return FrameOutcome::Continue;
        }

        let messages = frame["arguments"][0]["messages"].as_array();
        let Some(messages) = messages.filter(|m| !m.is_empty()) else {
            return self.throttle_hint(frame);
        };
        if messages[0]["author"] != "bot" {
            return self.throttle_hint(frame);
        }
        let first = &messages[0];
        let last = messages.last().unwrap_or(first);

        if first["contentOrigin"] == "Apology" {
            debug!("apology in progress frame");
            if !self.has_text() {
                self.apology = true;
            }
            self.stop_token_found = true;
            let mut reply = self.partial_reply();
            if reply.text.is_empty() {
                reply.text = last["spokenText"].as_str().unwrap_or_default().to_string();
            }
            return FrameOutcome::Settled(Settlement::Reply(reply));
        }

        if !last["adaptiveCards"].is_null() {
            self.adaptive_cards = Some(last["adaptiveCards"].clone());
        }
        if !last["suggestedResponses"].is_null() {
            self.suggested_responses = Some(last["suggestedResponses"].clone());
        }

        let updated = first["text"].as_str().unwrap_or_default();
        if updated.is_empty() || updated == self.fragments[self.cursor] {
            return FrameOutcome::Continue;
        }

        let current_nonempty = !self.fragments[self.cursor].is_empty();
        if current_nonempty && updated.starts_with(self.fragments[self.cursor].as_str()) {
            if updated.trim_end().ends_with(STOP_TOKEN) {
                // The service started role-playing the user; drop the marker
                // and freeze the answer without closing the socket yet.
                self.fragments[self.cursor] =
                    updated.replacen(STOP_TOKEN, "", 1).trim().to_string();
                self.stop_token_found = true;
                return FrameOutcome::Continue;
            }
            self.fragments[self.cursor] = updated.to_string();
        } else if current_nonempty {
            // Not a continuation: the service restarted a new answer part.
            self.cursor += 1;
            self.fragments.push(updated.to_string());
        } else {
            self.fragments[self.cursor].push_str(updated);
        }
        FrameOutcome::Continue
    }

    fn throttle_hint(&self, frame: &Value) -> FrameOutcome {
        match frame["arguments"][0]["throttling"]["maxNumUserMessagesInConversation"].as_u64() {
            Some(budget) => FrameOutcome::Throttled {
                max_user_turns: budget as u32,
            },
            None => FrameOutcome::Continue,
        }
    }

    /// Terminal frame (`type: 2`). Always ends the exchange unless an
    /// apology already settled it.
    fn apply_final(&mut self, frame: &Value) -> FrameOutcome {
        if self.apology {
            return FrameOutcome::Continue;
        }

        let item = &frame["item"];
        let result = &item["result"];

        if result["value"] == "InvalidSession" {
            return FrameOutcome::Settled(Settlement::Failed(SydneyError::SessionInvalid(
                result["message"].as_str().unwrap_or_default().to_string(),
            )));
        }
        // Hard failure regardless of any partial text or other fields.
        if result["exception"]
            .as_str()
            .is_some_and(|e| e.contains("maximum context length"))
        {
            return FrameOutcome::Settled(Settlement::Failed(SydneyError::ContextTooLong));
        }

        let empty = Vec::new();
        let messages = item["messages"].as_array().unwrap_or(&empty);

        let image_tag: String = messages
            .iter()
            .filter(|m| m["contentType"] == "IMAGE")
            .filter_map(|m| m["text"].as_str())
            .collect();
        let final_text: String = messages
            .iter()
            .filter(|m| m["author"] == "bot" && m["contentType"] != "IMAGE")
            .filter_map(|m| m["text"].as_str())
            .collect();

        let Some(last) = messages.last() else {
            if self.has_text() {
                return FrameOutcome::Settled(Settlement::Reply(self.partial_reply()));
            }
            return FrameOutcome::Settled(Settlement::Failed(SydneyError::Service {
                value: "NoMessage".into(),
                detail: "no message was generated".into(),
            }));
        };

        // Error-shaped terminal: the aggregated author is not the bot. No
        // trustworthy payload exists, so classify and fail.
        if last["author"] != "bot" {
            if result["value"] == "Throttled" {
                warn!(result = %result, "account throttled by the service");
                return FrameOutcome::Settled(Settlement::Failed(SydneyError::RateLimited));
            }
            return FrameOutcome::Settled(Settlement::Failed(SydneyError::Service {
                value: result["value"].as_str().unwrap_or("Unknown").to_string(),
                detail: format!(
                    "{} {}",
                    result["error"].as_str().unwrap_or_default(),
                    result["exception"].as_str().unwrap_or_default()
                )
                .trim()
                .to_string(),
            }));
        }

        if last["contentOrigin"] == "Apology" {
            debug!("apology in terminal frame");
            if !self.has_text() {
                self.apology = true;
            }
            self.stop_token_found = true;
            let mut reply = self.partial_reply();
            if reply.text.is_empty() {
                reply.text = last["spokenText"].as_str().unwrap_or_default().to_string();
            }
            if !image_tag.is_empty() {
                reply.image_tag = Some(image_tag);
            }
            return FrameOutcome::Settled(Settlement::Reply(reply));
        }

        // Bot-authored terminal carrying an explicit error: partial text
        // wins over the failure, an empty buffer surfaces the error.
        if !result["error"].is_null() {
            if self.has_text() {
                return FrameOutcome::Settled(Settlement::Reply(self.partial_reply()));
            }
            return FrameOutcome::Settled(Settlement::Failed(SydneyError::Service {
                value: result["value"].as_str().unwrap_or("Unknown").to_string(),
                detail: result["message"].as_str().unwrap_or_default().to_string(),
            }));
        }

        let mut reply = AssembledReply {
            text: final_text,
            adaptive_cards: if last["adaptiveCards"].is_null() {
                self.adaptive_cards.clone()
            } else {
                Some(last["adaptiveCards"].clone())
            },
            suggested_responses: if last["suggestedResponses"].is_null() {
                self.suggested_responses.clone()
            } else {
                Some(last["suggestedResponses"].clone())
            },
            image_tag: (!image_tag.is_empty()).then_some(image_tag),
            apology: false,
        };
        // After a stop token (or a moderation topic change) the terminal
        // frame may repeat text that was deliberately ignored; trust the
        // accumulated fragments instead.
        let topic_changed = messages
            .first()
            .is_some_and(|m| !m["topicChangerText"].is_null());
        if self.stop_token_found || topic_changed {
            reply.text = self.text();
            reply.adaptive_cards = self.adaptive_cards.clone();
        }
        if reply.text.is_empty() && self.has_text() {
            reply.text = self.text();
        }
        FrameOutcome::Settled(Settlement::Reply(reply))
    }
}
