//! Preview binary - runs a recorded message event through the length gate
//! and the shaper, and prints the webhook payload that would be sent.
//! Nothing is translated or posted.
//!
//! Usage:
//!   cargo run --bin preview -- event.json
//!   cargo run --bin preview -- event.json --as "Display Name"
//!
//! The file holds either a `message_create` envelope or a bare message object.
//!
//! Optional:
//! - MIN_MSG_LEN (defaults to 4)
//! - MAX_MSG_LEN (defaults to 2000)

use anyhow::{bail, Context, Result};
use std::fs;
use tracing::info;

use channel_relay::discord::{MemberIdentity, OutboundMessage};
use channel_relay::events::{MessageEvent, PlatformEvent};
use channel_relay::filter::{CooldownDedupeFilter, FilterSettings};
use channel_relay::shaper;
use channel_relay::Config;

fn load_event(path: &str) -> Result<MessageEvent> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;

    if let Ok(event) = serde_json::from_str::<PlatformEvent>(&raw) {
        return match event {
            PlatformEvent::MessageCreate(msg) => Ok(msg),
            PlatformEvent::ChannelDelete(_) => bail!("{} holds a channel_delete event", path),
        };
    }
    serde_json::from_str(&raw).with_context(|| format!("{} is not a message event", path))
}

fn preview_settings() -> FilterSettings {
    let defaults = Config::default();
    let env_len = |key: &str, default: usize| {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };

    FilterSettings {
        min_len: env_len("MIN_MSG_LEN", defaults.min_msg_len),
        max_len: env_len("MAX_MSG_LEN", defaults.max_msg_len),
        ..FilterSettings::from_config(&defaults)
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("preview=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.first() else {
        bail!("usage: preview <event.json> [--as <display name>]");
    };
    let display_override = args
        .iter()
        .position(|a| a == "--as")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let msg = load_event(path)?;
    info!(
        "Loaded message {} from channel {} ({} attachments)",
        msg.id,
        msg.channel_id,
        msg.attachments.len()
    );

    let filter = CooldownDedupeFilter::new(preview_settings());
    let gated = match filter.gate_length(&msg.content, msg.has_attachments()) {
        Ok(gated) => gated,
        Err(reason) => {
            println!("Message would be dropped: {}", reason);
            return Ok(());
        }
    };

    let shaped = shaper::shape(&gated.text, &msg.attachments);
    let identity = MemberIdentity {
        display_name: display_override.unwrap_or_else(|| msg.author.display_name().to_string()),
        avatar_url: Some(msg.author.avatar_url()),
    };

    println!("\n{}", "=".repeat(60));
    println!(
        "RELAY PREVIEW (would translate: {}, embeds: {})",
        gated.should_translate,
        shaped.embeds.len()
    );
    println!("{}\n", "=".repeat(60));

    let primary = OutboundMessage::new(&identity, shaped.content, shaped.embeds);
    println!("{}", serde_json::to_string_pretty(&primary)?);

    for (n, links) in shaped.follow_up.into_iter().enumerate() {
        println!("\n--- follow-up {} ---", n + 1);
        let extra = OutboundMessage::new(&identity, links, Vec::new());
        println!("{}", serde_json::to_string_pretty(&extra)?);
    }

    Ok(())
}
