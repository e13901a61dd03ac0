//! Messaging platform REST client.
//!
//! `Platform` is the seam the relay pipeline talks to; `DiscordClient` is the
//! production implementation over the Discord HTTP API.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PlatformError;
use crate::events::{Id, AVATAR_SIZE, CDN_URL};

/// Name given to webhooks created by the relay
pub const WEBHOOK_NAME: &str = "Channel Relay";

/// Maximum webhook username length accepted by the platform
pub const MAX_USERNAME_CHARS: usize = 80;

const DEFAULT_USERNAME: &str = "Proxy";

/// Administrator permission bit
const ADMINISTRATOR: u64 = 1 << 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Display identity of a guild member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// A webhook the relay can post through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHandle {
    pub id: Id,
    pub token: String,
    pub channel_id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub image: EmbedImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

impl AllowedMentions {
    /// Suppress every mention
    pub fn none() -> Self {
        Self { parse: Vec::new() }
    }
}

/// Webhook execution payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub content: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    pub allowed_mentions: AllowedMentions,
}

/// Trim a display name to what the platform accepts for webhook usernames
pub fn webhook_username(name: &str) -> String {
    let trimmed = name.trim();
    let name = if trimmed.is_empty() {
        DEFAULT_USERNAME
    } else {
        trimmed
    };
    name.chars().take(MAX_USERNAME_CHARS).collect()
}

impl OutboundMessage {
    pub fn new(identity: &MemberIdentity, content: String, embed_urls: Vec<String>) -> Self {
        Self {
            content,
            username: webhook_username(&identity.display_name),
            avatar_url: identity.avatar_url.clone(),
            embeds: embed_urls
                .into_iter()
                .map(|url| Embed {
                    image: EmbedImage { url },
                })
                .collect(),
            allowed_mentions: AllowedMentions::none(),
        }
    }

    /// Same identity and text, embeds dropped
    pub fn text_only(&self) -> Self {
        Self {
            embeds: Vec::new(),
            ..self.clone()
        }
    }
}

/// Operations the relay needs from the messaging platform.
pub trait Platform: Send + Sync {
    /// Whether a message still exists (false when it was deleted)
    fn message_exists(&self, channel: Id, message: Id) -> BoxFuture<'_, Result<bool, PlatformError>>;

    fn fetch_member(&self, guild: Id, user: Id) -> BoxFuture<'_, Result<MemberIdentity, PlatformError>>;

    fn guild_owner(&self, guild: Id) -> BoxFuture<'_, Result<Id, PlatformError>>;

    /// First non-bot member holding an administrator role
    fn first_human_admin(&self, guild: Id) -> BoxFuture<'_, Result<Option<Id>, PlatformError>>;

    fn send_direct_message<'a>(&'a self, user: Id, content: &'a str) -> BoxFuture<'a, Result<(), PlatformError>>;

    fn send_channel_message<'a>(&'a self, channel: Id, content: &'a str) -> BoxFuture<'a, Result<(), PlatformError>>;

    /// Find or create the relay's webhook in a channel
    fn ensure_webhook(&self, channel: Id) -> BoxFuture<'_, Result<WebhookHandle, PlatformError>>;

    fn execute_webhook<'a>(
        &'a self,
        webhook: &'a WebhookHandle,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<(), PlatformError>>;

    /// True for webhooks the relay itself posts through
    fn is_own_webhook(&self, webhook: Id) -> bool;
}

// Discord API response types

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: Id,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    user: ApiUser,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    roles: Vec<Id>,
}

#[derive(Debug, Deserialize)]
struct ApiGuild {
    owner_id: Id,
}

#[derive(Debug, Deserialize)]
struct ApiRole {
    id: Id,
    permissions: String,
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: Id,
}

#[derive(Debug, Deserialize)]
struct ApiWebhook {
    id: Id,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<ApiWebhookOwner>,
}

#[derive(Debug, Deserialize)]
struct ApiWebhookOwner {
    id: Id,
}

/// Resolve a member's display identity: nick, then global name, then username
fn member_identity(guild: Id, member: &ApiMember) -> MemberIdentity {
    let user = &member.user;
    let display_name = member
        .nick
        .clone()
        .or_else(|| user.global_name.clone())
        .unwrap_or_else(|| user.username.clone());

    let avatar_url = match (&member.avatar, &user.avatar) {
        (Some(hash), _) => Some(format!(
            "{}/guilds/{}/users/{}/avatars/{}.png?size={}",
            CDN_URL, guild, user.id, hash, AVATAR_SIZE
        )),
        (None, Some(hash)) => Some(format!(
            "{}/avatars/{}/{}.png?size={}",
            CDN_URL, user.id, hash, AVATAR_SIZE
        )),
        (None, None) => None,
    };

    MemberIdentity {
        display_name,
        avatar_url,
    }
}

fn admin_role_ids(roles: &[ApiRole]) -> HashSet<Id> {
    roles
        .iter()
        .filter(|role| {
            role.permissions
                .parse::<u64>()
                .is_ok_and(|perms| perms & ADMINISTRATOR != 0)
        })
        .map(|role| role.id)
        .collect()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        404 => PlatformError::NotFound,
        403 => PlatformError::Forbidden(body),
        code => PlatformError::Api { status: code, body },
    })
}

pub struct DiscordClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    bot_user: OnceCell<Id>,
    webhooks: Mutex<HashMap<Id, WebhookHandle>>,
}

impl DiscordClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            bot_user: OnceCell::new(),
            webhooks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, PlatformError> {
        Self::new(&config.discord_api_url, &config.discord_bot_token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bot {}", self.token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let response = self.auth(self.http.get(self.url(path))).send().await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PlatformError> {
        let response = self
            .auth(self.http.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }

    async fn post_message(&self, channel: Id, content: &str) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "content": content,
            "allowed_mentions": AllowedMentions::none(),
        });
        let _: serde_json::Value = self
            .post_json(&format!("/channels/{}/messages", channel), &body)
            .await?;
        Ok(())
    }

    async fn bot_user_id(&self) -> Result<Id, PlatformError> {
        self.bot_user
            .get_or_try_init(|| async {
                let me: ApiUser = self.get_json("/users/@me").await?;
                info!("Authenticated as bot user {} ({})", me.username, me.id);
                Ok(me.id)
            })
            .await
            .copied()
    }

    fn cached_webhook(&self, channel: Id) -> Option<WebhookHandle> {
        self.webhooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel)
            .cloned()
    }

    fn cache_webhook(&self, handle: WebhookHandle) {
        self.webhooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.channel_id, handle);
    }

    fn evict_webhook(&self, channel: Id) {
        self.webhooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&channel);
    }

    async fn resolve_webhook(&self, channel: Id) -> Result<WebhookHandle, PlatformError> {
        if let Some(handle) = self.cached_webhook(channel) {
            return Ok(handle);
        }

        let me = self.bot_user_id().await?;
        let existing: Vec<ApiWebhook> = self
            .get_json(&format!("/channels/{}/webhooks", channel))
            .await?;

        for hook in existing {
            let ours = hook.user.as_ref().is_some_and(|owner| owner.id == me);
            if !ours {
                continue;
            }
            match hook.token {
                Some(token) => {
                    let handle = WebhookHandle {
                        id: hook.id,
                        token,
                        channel_id: channel,
                    };
                    self.cache_webhook(handle.clone());
                    return Ok(handle);
                }
                None => {
                    // Unusable without a token
                    let response = self
                        .auth(self.http.delete(self.url(&format!("/webhooks/{}", hook.id))))
                        .send()
                        .await?;
                    if let Err(e) = check_status(response).await {
                        warn!("Failed to delete tokenless webhook {}: {}", hook.id, e);
                    }
                }
            }
        }

        let created: ApiWebhook = self
            .post_json(
                &format!("/channels/{}/webhooks", channel),
                &serde_json::json!({ "name": WEBHOOK_NAME }),
            )
            .await?;
        let token = created
            .token
            .ok_or_else(|| PlatformError::Decode("created webhook has no token".to_string()))?;

        info!("Created relay webhook {} in channel {}", created.id, channel);
        let handle = WebhookHandle {
            id: created.id,
            token,
            channel_id: channel,
        };
        self.cache_webhook(handle.clone());
        Ok(handle)
    }

    async fn run_webhook(
        &self,
        webhook: &WebhookHandle,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let url = self.url(&format!("/webhooks/{}/{}", webhook.id, webhook.token));
        let response = self.http.post(url).json(message).send().await?;
        match check_status(response).await {
            Ok(_) => Ok(()),
            Err(PlatformError::NotFound) => {
                debug!("Webhook {} is gone, evicting from cache", webhook.id);
                self.evict_webhook(webhook.channel_id);
                Err(PlatformError::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_first_human_admin(&self, guild: Id) -> Result<Option<Id>, PlatformError> {
        let roles: Vec<ApiRole> = self.get_json(&format!("/guilds/{}/roles", guild)).await?;
        let admin_roles = admin_role_ids(&roles);
        if admin_roles.is_empty() {
            return Ok(None);
        }

        let members: Vec<ApiMember> = self
            .get_json(&format!("/guilds/{}/members?limit=1000", guild))
            .await?;
        Ok(members
            .into_iter()
            .find(|m| !m.user.bot && m.roles.iter().any(|r| admin_roles.contains(r)))
            .map(|m| m.user.id))
    }
}

impl Platform for DiscordClient {
    fn message_exists(&self, channel: Id, message: Id) -> BoxFuture<'_, Result<bool, PlatformError>> {
        Box::pin(async move {
            let path = format!("/channels/{}/messages/{}", channel, message);
            match self.get_json::<serde_json::Value>(&path).await {
                Ok(_) => Ok(true),
                Err(PlatformError::NotFound) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn fetch_member(&self, guild: Id, user: Id) -> BoxFuture<'_, Result<MemberIdentity, PlatformError>> {
        Box::pin(async move {
            let member: ApiMember = self
                .get_json(&format!("/guilds/{}/members/{}", guild, user))
                .await?;
            Ok(member_identity(guild, &member))
        })
    }

    fn guild_owner(&self, guild: Id) -> BoxFuture<'_, Result<Id, PlatformError>> {
        Box::pin(async move {
            let guild: ApiGuild = self.get_json(&format!("/guilds/{}", guild)).await?;
            Ok(guild.owner_id)
        })
    }

    fn first_human_admin(&self, guild: Id) -> BoxFuture<'_, Result<Option<Id>, PlatformError>> {
        Box::pin(self.find_first_human_admin(guild))
    }

    fn send_direct_message<'a>(&'a self, user: Id, content: &'a str) -> BoxFuture<'a, Result<(), PlatformError>> {
        Box::pin(async move {
            let dm: ApiChannel = self
                .post_json("/users/@me/channels", &serde_json::json!({ "recipient_id": user }))
                .await?;
            self.post_message(dm.id, content).await
        })
    }

    fn send_channel_message<'a>(&'a self, channel: Id, content: &'a str) -> BoxFuture<'a, Result<(), PlatformError>> {
        Box::pin(self.post_message(channel, content))
    }

    fn ensure_webhook(&self, channel: Id) -> BoxFuture<'_, Result<WebhookHandle, PlatformError>> {
        Box::pin(self.resolve_webhook(channel))
    }

    fn execute_webhook<'a>(
        &'a self,
        webhook: &'a WebhookHandle,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<(), PlatformError>> {
        Box::pin(self.run_webhook(webhook, message))
    }

    fn is_own_webhook(&self, webhook: Id) -> bool {
        self.webhooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|handle| handle.id == webhook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DiscordClient {
        DiscordClient::new(&server.uri(), "test-token").unwrap()
    }

    fn identity(name: &str) -> MemberIdentity {
        MemberIdentity {
            display_name: name.to_string(),
            avatar_url: Some("https://cdn.example/a.png".to_string()),
        }
    }

    // ==================== Payload Building ====================

    #[test]
    fn test_webhook_username_trimming() {
        assert_eq!(webhook_username("  Ana  "), "Ana");
        assert_eq!(webhook_username("   "), "Proxy");
        assert_eq!(webhook_username(&"x".repeat(100)).chars().count(), 80);
    }

    #[test]
    fn test_outbound_message_serialization() {
        let msg = OutboundMessage::new(
            &identity("Ana"),
            "hola".to_string(),
            vec!["https://cdn.example/i.png".to_string()],
        );
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["username"], "Ana");
        assert_eq!(json["embeds"][0]["image"]["url"], "https://cdn.example/i.png");
        assert_eq!(json["allowed_mentions"]["parse"], serde_json::json!([]));
    }

    #[test]
    fn test_text_only_drops_embeds() {
        let msg = OutboundMessage::new(
            &identity("Ana"),
            "hola".to_string(),
            vec!["https://cdn.example/i.png".to_string()],
        );
        let plain = msg.text_only();
        assert!(plain.embeds.is_empty());
        assert_eq!(plain.username, msg.username);

        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("embeds").is_none());
    }

    #[test]
    fn test_member_identity_prefers_nick_and_guild_avatar() {
        let member: ApiMember = serde_json::from_value(serde_json::json!({
            "user": {"id": "5", "username": "ana", "global_name": "Ana G", "avatar": "u1"},
            "nick": "Annie",
            "avatar": "g1",
            "roles": []
        }))
        .unwrap();
        let id = member_identity(Id(9), &member);
        assert_eq!(id.display_name, "Annie");
        assert_eq!(
            id.avatar_url.as_deref(),
            Some("https://cdn.discordapp.com/guilds/9/users/5/avatars/g1.png?size=128")
        );
    }

    #[test]
    fn test_admin_role_detection() {
        let roles = vec![
            ApiRole { id: Id(1), permissions: "8".to_string() },
            ApiRole { id: Id(2), permissions: "2048".to_string() },
            ApiRole { id: Id(3), permissions: "garbage".to_string() },
        ];
        let admins = admin_role_ids(&roles);
        assert!(admins.contains(&Id(1)));
        assert_eq!(admins.len(), 1);
    }

    // ==================== REST Calls ====================

    #[tokio::test]
    async fn test_message_exists_maps_404_to_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/1/messages/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/1/messages/3"))
            .and(header("Authorization", "Bot test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "3"})))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(!client.message_exists(Id(1), Id(2)).await.unwrap());
        assert!(client.message_exists(Id(1), Id(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_webhook_reuses_own_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "100", "username": "relay"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/7/webhooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "50", "token": "other", "user": {"id": "999"}},
                {"id": "51", "token": "ours", "user": {"id": "100"}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let first = client.ensure_webhook(Id(7)).await.unwrap();
        let second = client.ensure_webhook(Id(7)).await.unwrap();

        assert_eq!(first.id, Id(51));
        assert_eq!(first.token, "ours");
        assert_eq!(first, second);
        assert!(client.is_own_webhook(Id(51)));
        assert!(!client.is_own_webhook(Id(50)));
    }

    #[tokio::test]
    async fn test_resolve_webhook_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "100", "username": "relay"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/7/webhooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/7/webhooks"))
            .and(body_partial_json(serde_json::json!({"name": WEBHOOK_NAME})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "60", "token": "fresh"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handle = client(&server).ensure_webhook(Id(7)).await.unwrap();
        assert_eq!(handle.id, Id(60));
        assert_eq!(handle.channel_id, Id(7));
    }

    #[tokio::test]
    async fn test_webhook_without_permission_is_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "100", "username": "relay"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/7/webhooks"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
            .mount(&server)
            .await;

        let err = client(&server).ensure_webhook(Id(7)).await.unwrap_err();
        assert!(matches!(err, PlatformError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_execute_webhook_evicts_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhooks/51/ours"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        let handle = WebhookHandle {
            id: Id(51),
            token: "ours".to_string(),
            channel_id: Id(7),
        };
        client.cache_webhook(handle.clone());
        assert!(client.is_own_webhook(Id(51)));

        let msg = OutboundMessage::new(&identity("Ana"), "hi".to_string(), vec![]);
        let err = client.execute_webhook(&handle, &msg).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotFound));
        assert!(!client.is_own_webhook(Id(51)));
    }

    #[tokio::test]
    async fn test_send_direct_message_opens_dm_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/@me/channels"))
            .and(body_partial_json(serde_json::json!({"recipient_id": "42"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "800"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/800/messages"))
            .and(body_partial_json(serde_json::json!({"content": "heads up"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "801"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .send_direct_message(Id(42), "heads up")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_human_admin_skips_bots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/guilds/3/roles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "10", "permissions": "8"},
                {"id": "11", "permissions": "0"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/3/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"user": {"id": "1", "username": "plain"}, "roles": ["11"]},
                {"user": {"id": "2", "username": "botty", "bot": true}, "roles": ["10"]},
                {"user": {"id": "3", "username": "admin"}, "roles": ["10"]}
            ])))
            .mount(&server)
            .await;

        let admin = client(&server).first_human_admin(Id(3)).await.unwrap();
        assert_eq!(admin, Some(Id(3)));
    }
}
