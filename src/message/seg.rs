use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MessageBase;

/// One node of the canonical message tree.
///
/// Serialized as `{"type": <tag>, "data": <payload>}`. A `seglist` holds an
/// ordered child list; nesting depth is unbounded on the wire (the forward
/// translator caps what it will build).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Seg {
    Text(String),
    /// Native platform face id. Lenient payload: cores send ints or strings.
    Face(IntOrString),
    /// Base64 image payload (URL transiently while a forward tree is built).
    Image(String),
    /// Animated sticker, base64 (URL transiently inside forward trees).
    Emoji(String),
    /// Base64 audio payload.
    Voice(String),
    #[serde(rename = "voiceurl")]
    VoiceUrl(String),
    #[serde(rename = "imageurl")]
    ImageUrl(String),
    /// Base64 video payload.
    Video(String),
    #[serde(rename = "videourl")]
    VideoUrl(String),
    VideoCard(VideoCardData),
    File(FileData),
    Music(MusicData),
    MusicCard(MusicCardData),
    MiniappCard(MiniappCardData),
    At(IntOrString),
    /// Referenced message id, or the literal `"notice"` (never echoed out).
    Reply(IntOrString),
    /// A list of complete envelopes to re-send as forward nodes.
    Forward(Vec<MessageBase>),
    /// Structured notice payload; shape varies per notice sub_type.
    Notify(Value),
    /// A command for the dispatcher: `{"name": ..., "args": {...}}`.
    Command(Value),
    Seglist(Vec<Seg>),
    /// Reference to an already-sent gateway message (forward nodes).
    Id(IntOrString),
}

impl Seg {
    pub fn text(text: impl Into<String>) -> Self {
        Seg::Text(text.into())
    }

    pub fn seglist(children: Vec<Seg>) -> Self {
        Seg::Seglist(children)
    }

    /// Tag name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Seg::Text(_) => "text",
            Seg::Face(_) => "face",
            Seg::Image(_) => "image",
            Seg::Emoji(_) => "emoji",
            Seg::Voice(_) => "voice",
            Seg::VoiceUrl(_) => "voiceurl",
            Seg::ImageUrl(_) => "imageurl",
            Seg::Video(_) => "video",
            Seg::VideoUrl(_) => "videourl",
            Seg::VideoCard(_) => "video_card",
            Seg::File(_) => "file",
            Seg::Music(_) => "music",
            Seg::MusicCard(_) => "music_card",
            Seg::MiniappCard(_) => "miniapp_card",
            Seg::At(_) => "at",
            Seg::Reply(_) => "reply",
            Seg::Forward(_) => "forward",
            Seg::Notify(_) => "notify",
            Seg::Command(_) => "command",
            Seg::Seglist(_) => "seglist",
            Seg::Id(_) => "id",
        }
    }
}

/// Payload that platforms send either as a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Num(i64),
    Text(String),
}

impl IntOrString {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IntOrString::Num(n) => Some(*n),
            IntOrString::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            IntOrString::Num(n) => n.to_string(),
            IntOrString::Text(s) => s.clone(),
        }
    }
}

impl From<i64> for IntOrString {
    fn from(n: i64) -> Self {
        IntOrString::Num(n)
    }
}

impl From<&str> for IntOrString {
    fn from(s: &str) -> Self {
        IntOrString::Text(s.to_string())
    }
}

/// `video_card` payload: metadata of a platform-hosted video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoCardData {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_size: String,
    #[serde(default)]
    pub url: String,
}

/// `music_card` payload extracted from a platform card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MusicCardData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub singer: String,
    #[serde(default)]
    pub jump_url: String,
    #[serde(default)]
    pub music_url: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub preview: String,
}

/// `miniapp_card` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MiniappCardData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub icon: String,
}

/// `file` payload: a bare path/URL or a structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileData {
    Path(String),
    Detail(FileDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `music` payload: a bare song id (platform 163) or `{type, id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MusicData {
    SongId(String),
    Platform(MusicPlatform),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicPlatform {
    #[serde(rename = "type")]
    pub platform: String,
    pub id: Value,
}
