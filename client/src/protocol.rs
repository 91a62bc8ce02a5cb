use std::fmt;

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use crate::error::ProtocolError;

/// Messages pushed by the room server (must match server protocol)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomState(RoomState),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    Sync(SyncUpdate),
    SyncCorrection(SyncCorrection),
    Seek(SeekUpdate),
    Chat(ChatMessage),
    VideoChanged(VideoChanged),
    Error { message: String },
    Pong,
}

/// Discriminant of [`ServerMessage`], used as the handler registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RoomState,
    UserJoined,
    UserLeft,
    Sync,
    SyncCorrection,
    Seek,
    Chat,
    VideoChanged,
    Error,
    Pong,
}

impl MessageKind {
    pub fn from_wire(tag: &str) -> Option<Self> {
        let kind = match tag {
            "room_state" => Self::RoomState,
            "user_joined" => Self::UserJoined,
            "user_left" => Self::UserLeft,
            "sync" => Self::Sync,
            "sync_correction" => Self::SyncCorrection,
            "seek" => Self::Seek,
            "chat" => Self::Chat,
            "video_changed" => Self::VideoChanged,
            "error" => Self::Error,
            "pong" => Self::Pong,
            _ => return None,
        };
        Some(kind)
    }
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RoomState(_) => MessageKind::RoomState,
            Self::UserJoined(_) => MessageKind::UserJoined,
            Self::UserLeft(_) => MessageKind::UserLeft,
            Self::Sync(_) => MessageKind::Sync,
            Self::SyncCorrection(_) => MessageKind::SyncCorrection,
            Self::Seek(_) => MessageKind::Seek,
            Self::Chat(_) => MessageKind::Chat,
            Self::VideoChanged(_) => MessageKind::VideoChanged,
            Self::Error { .. } => MessageKind::Error,
            Self::Pong => MessageKind::Pong,
        }
    }
}

/// Parse one text frame. Unknown tags and malformed bodies are reported
/// separately so the caller can log them differently.
pub fn decode_frame(text: &str) -> Result<ServerMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let tag = envelope.kind.ok_or(ProtocolError::MissingType)?;
    if MessageKind::from_wire(&tag).is_none() {
        return Err(ProtocolError::UnknownType(tag));
    }
    Ok(serde_json::from_str(text)?)
}

/// Just the tag of an inbound frame
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// `null` and missing both read as an empty string
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Messages sent by this client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        username: String,
        avatar: String,
    },
    Play {
        time: f64,
    },
    Pause {
        time: f64,
    },
    Seek {
        time: f64,
    },
    BufferStart,
    BufferEnd,
    GetState,
    VideoChange {
        url: String,
        user_agent: String,
        referer: String,
        subtitle_url: String,
    },
    Chat {
        message: String,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        current_time: Option<f64>,
    },
}

/// Authoritative room snapshot. Superseded entirely by the next one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoomState {
    pub users: Vec<Member>,
    #[serde(deserialize_with = "null_as_empty")]
    pub video_url: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub video_format: String,
    pub headers: Headers,
    #[serde(deserialize_with = "null_as_empty")]
    pub video_title: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub subtitle_url: String,
    pub current_time: f64,
    pub is_playing: bool,
    pub chat_messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Member {
    pub username: String,
    pub avatar: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserJoined {
    pub users: Vec<Member>,
    pub username: String,
    pub avatar: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserLeft {
    pub users: Vec<Member>,
    #[serde(deserialize_with = "null_as_empty")]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncUpdate {
    pub current_time: f64,
    pub is_playing: bool,
    #[serde(default)]
    pub triggered_by: Option<String>,
    /// Ask for the tight threshold on this reconciliation
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionAction {
    /// Soft correction through playback rate
    Rate,
    /// Hard correction: pause, reseek, resume
    Buffer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncCorrection {
    pub action: CorrectionAction,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub drift: Option<f64>,
    #[serde(default)]
    pub target_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeekUpdate {
    pub current_time: f64,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub username: String,
    pub avatar: String,
    pub message: String,
    pub timestamp: Option<Timestamp>,
}

/// Chat timestamps arrive either as epoch seconds or preformatted text
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Epoch(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoChanged {
    #[serde(deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub format: String,
    pub headers: Headers,
    #[serde(deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub subtitle_url: String,
    pub duration: Option<f64>,
    pub changed_by: Option<String>,
}

/// Request headers attached to a media source, kept in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Case-insensitive lookup; empty values count as absent
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get("user-agent")
    }

    pub fn referer(&self) -> Option<&str> {
        self.get("referer")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to string values")
            }

            fn visit_unit<E>(self) -> Result<Headers, E> {
                Ok(Headers::default())
            }

            fn visit_none<E>(self) -> Result<Headers, E> {
                Ok(Headers::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::default();
                while let Some((name, value)) = map.next_entry::<String, Option<String>>()? {
                    headers.insert(name, value.unwrap_or_default());
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_any(HeadersVisitor)
    }
}
