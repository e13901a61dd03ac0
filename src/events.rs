//! Inbound platform events.
//!
//! The gateway bridge forwards message and channel events to `POST /events`
//! as JSON tagged by `type`. Ids are snowflakes serialized as strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Base URL of the platform's media CDN
pub const CDN_URL: &str = "https://cdn.discordapp.com";

/// Avatar size requested when building avatar URLs
pub const AVATAR_SIZE: u32 = 128;

/// Platform snowflake id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Id(n)),
            Raw::Text(s) => s
                .parse()
                .map(Id)
                .map_err(|_| serde::de::Error::custom(format!("invalid snowflake: {}", s))),
        }
    }
}

/// Events accepted by the ingest endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    MessageCreate(MessageEvent),
    ChannelDelete(ChannelDeleteEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDeleteEvent {
    pub guild_id: Id,
    pub channel_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: Id,
    #[serde(default)]
    pub guild_id: Option<Id>,
    pub channel_id: Id,
    pub author: Author,
    /// Set when the message was posted through a webhook (proxy systems included)
    #[serde(default)]
    pub webhook_id: Option<Id>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageEvent {
    /// Posted by a proxy system on behalf of a user
    pub fn is_proxy_origin(&self) -> bool {
        self.webhook_id.is_some()
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: Id,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    /// Avatar hash
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl Author {
    pub fn display_name(&self) -> &str {
        self.global_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }

    /// Avatar URL, falling back to the platform's default avatar
    pub fn avatar_url(&self) -> String {
        match &self.avatar {
            Some(hash) => format!(
                "{}/avatars/{}/{}.png?size={}",
                CDN_URL, self.id, hash, AVATAR_SIZE
            ),
            None => format!("{}/embed/avatars/{}.png", CDN_URL, (self.id.0 >> 22) % 6),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Id,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".webp"];

/// True if the path (query string excluded) ends with a known image extension
pub fn has_image_extension(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path).to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        let by_type = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_lowercase().starts_with("image/"));
        by_type || has_image_extension(&self.filename)
    }

    pub fn is_spoiler(&self) -> bool {
        self.filename.starts_with("SPOILER_")
    }
}

/// True if the text contains an http(s) link
pub fn contains_url(text: &str) -> bool {
    text.contains("http://") || text.contains("https://")
}
