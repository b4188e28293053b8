//! Wire protocol for the ChatHub socket.
//!
//! Frames travel as text records delimited by the ASCII record separator.
//! Inbound frames are loosely-shaped JSON tagged by a numeric `type`; they
//! are kept as `serde_json::Value` and indexed leniently, since the service
//! omits and duplicates fields freely.

use rand::Rng;
use serde::Serialize;

use crate::negotiate::SessionCredentials;

/// Record separator between frames on the socket.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Fixed handshake frame sent on connect.
pub const HANDSHAKE_FRAME: &str = r#"{"protocol":"json","version":1}"#;

/// Fixed keep-alive frame sent on the heartbeat interval.
pub const PING_FRAME: &str = r#"{"type":6}"#;

/// Inbound frame type carrying a streaming progress update.
pub const FRAME_UPDATE: u64 = 1;
/// Inbound frame type that terminates the exchange.
pub const FRAME_FINAL: u64 = 2;

/// Marker the service emits when it starts role-playing the user; text after
/// it is never part of the answer.
pub const STOP_TOKEN: &str = "\n\nUser:";

/// Split a raw socket payload into parsed frames, dropping anything that is
/// not valid JSON.
pub fn split_records(raw: &str) -> Vec<serde_json::Value> {
    raw.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| serde_json::from_str(chunk).ok())
        .collect()
}

/// The handshake acknowledgement is an empty structured frame.
pub fn is_handshake_ack(frame: &serde_json::Value) -> bool {
    frame.as_object().is_some_and(|obj| obj.is_empty())
}

/// Frame `type` tag, if present.
pub fn frame_type(frame: &serde_json::Value) -> Option<u64> {
    frame["type"].as_u64()
}

// ---------------------------------------------------------------------------
// Outbound turn frame
// ---------------------------------------------------------------------------

/// Answer tone requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneStyle {
    Precise,
    Balanced,
    #[default]
    Creative,
    /// Jailbroken persona; same options token as Creative.
    Sydney,
}

impl ToneStyle {
    pub(crate) fn options_token(self) -> &'static str {
        match self {
            ToneStyle::Precise => "h3precise",
            ToneStyle::Balanced => "galileo",
            ToneStyle::Creative | ToneStyle::Sydney => "h3imaginative",
        }
    }

    pub(crate) fn tone_field(self) -> &'static str {
        match self {
            ToneStyle::Precise => "Precise",
            ToneStyle::Balanced => "Balanced",
            ToneStyle::Creative | ToneStyle::Sydney => "Creative",
        }
    }
}

/// Whether the turn may use search augmentation. Throttled accounts are
/// downgraded to `Chat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum MessageType {
    #[default]
    SearchQuery,
    Chat,
}

impl MessageType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MessageType::SearchQuery => "SearchQuery",
            MessageType::Chat => "Chat",
        }
    }
}

/// Author of a prior-turn message in the outbound context payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Bot,
}

/// A rendered prior turn carried in the outbound frame's message list.
#[derive(Debug, Clone, Serialize)]
pub struct PriorMessage {
    pub author: Author,
    pub text: String,
}

/// Everything needed to render the single outbound turn frame.
pub struct TurnFrame<'a> {
    pub prompt: &'a str,
    pub message_type: MessageType,
    pub tone: ToneStyle,
    pub credentials: &'a SessionCredentials,
    pub invocation_id: u64,
    pub previous_messages: &'a [PriorMessage],
    /// Side-channel context string (group metadata + overflow transcript).
    pub context: Option<&'a str>,
    pub client_ip: &'a str,
    pub locale: &'a str,
    pub market: &'a str,
}

impl TurnFrame<'_> {
    /// Render the structured invocation payload the hub expects.
    pub fn to_json(&self) -> serde_json::Value {
        let options_sets = [
            "nlu_direct_response_filter",
            "deepleo",
            "disable_emoji_spoken_text",
            "responsible_ai_policy_235",
            "enablemm",
            self.tone.options_token(),
            "dagslnv1",
            "sportsansgnd",
            "dl_edge_desc",
            "noknowimg",
            "dv3sugg",
            "gencontentv3",
        ];
        let allowed_message_types = [
            "ActionRequest",
            "Chat",
            "Context",
            "InternalSearchQuery",
            "InternalSearchResult",
            "Disengaged",
            "InternalLoaderMessage",
            "Progress",
            "RenderCardRequest",
            "AdsQuery",
            "SemanticSerp",
            "GenerateContentQuery",
            "SearchQuery",
        ];

        let mut previous: Vec<serde_json::Value> = self
            .previous_messages
            .iter()
            .map(|m| serde_json::json!({ "author": m.author, "text": m.text }))
            .collect();
        if let Some(context) = self.context.filter(|c| !c.is_empty()) {
            previous.push(serde_json::json!({
                "author": "user",
                "description": context,
                "contextType": "WebPage",
                "messageType": "Context",
                "messageId": "discover-web--page-ping-mriduna-----",
            }));
        }

        let mut argument = serde_json::json!({
            "source": "cib",
            "optionsSets": options_sets,
            "allowedMessageTypes": allowed_message_types,
            "sliceIds": [],
            "traceId": gen_trace_id(),
            "isStartOfSession": self.invocation_id == 0,
            "message": {
                "locale": self.locale,
                "market": self.market,
                "region": "HK",
                "author": "user",
                "inputMethod": "Keyboard",
                "text": self.prompt,
                "messageType": self.message_type.as_str(),
                "userIpAddress": self.client_ip,
                "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            },
            "tone": self.tone.tone_field(),
            "conversationSignature": self.credentials.conversation_signature,
            "participant": { "id": self.credentials.client_id },
            "spokenTextMode": "None",
            "conversationId": self.credentials.conversation_id,
        });
        if !previous.is_empty() {
            argument["previousMessages"] = serde_json::Value::Array(previous);
        }

        serde_json::json!({
            "arguments": [argument],
            "invocationId": self.invocation_id.to_string(),
            "target": "chat",
            "type": 4,
        })
    }
}

/// Random 32-char hex trace id for the turn frame.
pub fn gen_trace_id() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Spoofed client IP from a fixed /24, generated once per client.
pub fn random_client_ip() -> String {
    format!("104.28.215.{}", rand::thread_rng().gen_range(1..=254))
}
