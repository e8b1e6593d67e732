//! Wire protocol for the call board.
//!
//! Messages are serde enums whose variant names are the event names:
//!
//! ```text
//! client -> server                     server -> client
//! ─────────────────────────────        ─────────────────────────────────
//! number-added   {category, value,     initial-state   {session, seq, state}
//!                 announceText}        session-resumed {session, replayed}
//! number-deleted {category, position}  number-update   {seq, category, value,
//! entry-removed  {category, id}                         id, position, announceText}
//! repeat-message {text}                number-deleted  {seq, category, position, id}
//! ```
//!
//! Two frame codecs share these types: binary frames are bincode
//! (compact, used by the Rust client) and text frames are JSON (browser
//! clients). Inbound frames are decoded by frame type; the codec used for
//! outbound frames is picked per connection with `?format=`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::category::Category;
use crate::store::{EntryId, StoreSnapshot};

/// Outbound codec for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// bincode in binary frames
    #[default]
    Binary,
    /// JSON in text frames
    Json,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// A transport-neutral frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(b) => b.len(),
            Self::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server-bound intents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Append a value to a category
    #[serde(rename = "number-added", rename_all = "camelCase")]
    NumberAdded {
        category: Category,
        #[serde(alias = "number")]
        value: String,
        announce_text: Option<String>,
    },
    /// Legacy position-addressed removal
    #[serde(rename = "number-deleted", rename_all = "camelCase")]
    NumberDeleted {
        category: Category,
        #[serde(alias = "index")]
        position: usize,
    },
    /// Identifier-addressed removal
    #[serde(rename = "entry-removed")]
    EntryRemoved { category: Category, id: EntryId },
    /// Periodic summary, informational only
    #[serde(rename = "repeat-message")]
    RepeatMessage { text: String },
}

/// An addition applied to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Added {
    pub seq: u64,
    pub category: Category,
    pub value: String,
    pub id: EntryId,
    pub position: usize,
    pub announce_text: String,
}

/// A removal applied to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removed {
    pub seq: u64,
    pub category: Category,
    pub position: usize,
    pub id: EntryId,
}

/// A store mutation as fanned out to sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    Added(Added),
    Removed(Removed),
}

impl BoardEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Added(a) => a.seq,
            Self::Removed(r) => r.seq,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Added(a) => a.category,
            Self::Removed(r) => r.category,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        match self {
            Self::Added(a) => ServerMessage::NumberUpdate(a.clone()),
            Self::Removed(r) => ServerMessage::NumberDeleted(r.clone()),
        }
    }
}

/// Client-bound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full snapshot; `seq` is the last mutation it includes
    #[serde(rename = "initial-state")]
    InitialState {
        session: Uuid,
        seq: u64,
        state: StoreSnapshot,
    },
    /// Session recovered; `replayed` buffered events follow
    #[serde(rename = "session-resumed")]
    SessionResumed { session: Uuid, replayed: u64 },
    #[serde(rename = "number-update")]
    NumberUpdate(Added),
    #[serde(rename = "number-deleted")]
    NumberDeleted(Removed),
}

impl ServerMessage {
    /// The broadcast event carried by this message, if any.
    pub fn into_event(self) -> Option<BoardEvent> {
        match self {
            Self::NumberUpdate(a) => Some(BoardEvent::Added(a)),
            Self::NumberDeleted(r) => Some(BoardEvent::Removed(r)),
            Self::InitialState { .. } | Self::SessionResumed { .. } => None,
        }
    }
}

fn encode_frame<T: Serialize>(value: &T, format: WireFormat) -> Result<Frame, ProtocolError> {
    match format {
        WireFormat::Binary => bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(Frame::Binary)
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
        WireFormat::Json => serde_json::to_string(value)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::SerializationError(e.to_string())),
    }
}

fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

impl ClientMessage {
    pub fn encode(&self, format: WireFormat) -> Result<Frame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }
}

impl ServerMessage {
    pub fn encode(&self, format: WireFormat) -> Result<Frame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        decode_text(text)
    }
}

/// What a reconnecting client presents to recover its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeToken {
    pub session: Uuid,
    /// Last seq the client applied
    pub offset: u64,
}

/// Query parameters of the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectParams {
    pub format: WireFormat,
    pub resume: Option<ResumeToken>,
}

impl ConnectParams {
    /// Parse `format=..&session=..&offset=..`. Unknown keys are ignored;
    /// a resume token needs both a valid session and offset.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut format = WireFormat::default();
        let mut session = None;
        let mut offset = None;

        for pair in query.unwrap_or("").split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "format" => format = WireFormat::parse(value).unwrap_or_default(),
                "session" => session = Uuid::parse_str(value).ok(),
                "offset" => offset = value.parse().ok(),
                _ => {}
            }
        }

        let resume = match (session, offset) {
            (Some(session), Some(offset)) => Some(ResumeToken { session, offset }),
            _ => None,
        };
        Self { format, resume }
    }

    pub fn to_query(&self) -> String {
        let mut query = format!("format={}", self.format.as_str());
        if let Some(token) = self.resume {
            query.push_str(&format!("&session={}&offset={}", token.session, token.offset));
        }
        query
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    HandshakeFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::HandshakeFailed(e) => write!(f, "Handshake failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entry;

    fn added(seq: u64) -> Added {
        Added {
            seq,
            category: Category::Drs,
            value: "7".into(),
            id: EntryId(3),
            position: 0,
            announce_text: "DRS 7".into(),
        }
    }

    #[test]
    fn test_json_event_names() {
        let msg = ServerMessage::NumberUpdate(added(1));
        let Frame::Text(json) = msg.encode(WireFormat::Json).unwrap() else {
            panic!("json encodes to text frames");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let body = &value["number-update"];
        assert_eq!(body["category"], "DRS");
        assert_eq!(body["value"], "7");
        assert_eq!(body["announceText"], "DRS 7");
        assert_eq!(body["id"], 3);
    }

    #[test]
    fn test_client_json_accepts_legacy_field_names() {
        let msg = ClientMessage::decode_text(
            r#"{"number-added":{"category":"Check Date","number":"15","announceText":"Check Date 15"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::NumberAdded {
                category: Category::CheckDate,
                value: "15".into(),
                announce_text: Some("Check Date 15".into()),
            }
        );

        let msg = ClientMessage::decode_text(r#"{"number-deleted":{"category":"DRS","index":2}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::NumberDeleted {
                category: Category::Drs,
                position: 2
            }
        );
    }

    #[test]
    fn test_announce_text_is_optional_in_json() {
        let msg =
            ClientMessage::decode_text(r#"{"number-added":{"category":"DRS","value":"7"}}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::NumberAdded { announce_text: None, .. }
        ));
    }

    #[test]
    fn test_unknown_category_fails_decode() {
        let err = ClientMessage::decode_text(r#"{"number-added":{"category":"Refund","value":"7"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("invalid category"), "{err}");
    }

    #[test]
    fn test_binary_initial_state() {
        let mut state = StoreSnapshot::empty();
        state.lists.insert(
            Category::Override,
            vec![Entry {
                id: EntryId(1),
                value: "42".into(),
            }],
        );
        let session = Uuid::new_v4();
        let msg = ServerMessage::InitialState {
            session,
            seq: 9,
            state: state.clone(),
        };
        let Frame::Binary(bytes) = msg.encode(WireFormat::Binary).unwrap() else {
            panic!("bincode encodes to binary frames");
        };
        assert_eq!(
            ServerMessage::decode_binary(&bytes).unwrap(),
            ServerMessage::InitialState {
                session,
                seq: 9,
                state
            }
        );
    }

    #[test]
    fn test_binary_added_is_compact() {
        let frame = ServerMessage::NumberUpdate(added(1))
            .encode(WireFormat::Binary)
            .unwrap();
        assert!(frame.len() < 64, "encoded size {} too large", frame.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(ClientMessage::decode_binary(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode_text("not json").is_err());
    }

    #[test]
    fn test_board_event_accessors() {
        let event = BoardEvent::Removed(Removed {
            seq: 4,
            category: Category::CheckDate,
            position: 1,
            id: EntryId(2),
        });
        assert_eq!(event.seq(), 4);
        assert_eq!(event.category(), Category::CheckDate);
        assert_eq!(event.to_message().into_event(), Some(event));
    }

    #[test]
    fn test_connect_params_query() {
        let session = Uuid::new_v4();
        let params = ConnectParams {
            format: WireFormat::Json,
            resume: Some(ResumeToken { session, offset: 12 }),
        };
        let query = params.to_query();
        assert_eq!(ConnectParams::from_query(Some(&query)), params);

        let plain = ConnectParams::from_query(None);
        assert_eq!(plain.format, WireFormat::Binary);
        assert!(plain.resume.is_none());

        // A session without an offset is not resumable.
        let partial = ConnectParams::from_query(Some(&format!("session={session}")));
        assert!(partial.resume.is_none());

        let junk = ConnectParams::from_query(Some("format=xml&session=nope&offset=1&x"));
        assert_eq!(junk.format, WireFormat::Binary);
        assert!(junk.resume.is_none());
    }
}
