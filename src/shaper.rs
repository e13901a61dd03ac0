//! Builds the outbound message body: text, image embeds, attachment links
//! and the relay marker.

use regex::Regex;
use std::sync::OnceLock;

use crate::events::{contains_url, has_image_extension, Attachment};

/// Invisible character appended to every relayed message
pub const RELAY_MARKER: char = '\u{200b}';

/// Maximum image embeds per outbound message
pub const MAX_EMBEDS: usize = 10;

/// Platform hard limit on message content, in characters
pub const PLATFORM_MESSAGE_LIMIT: usize = 2000;

const ATTACHMENTS_HEADER: &str = "**Attachments:**";

/// Outbound payload produced by the shaper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedMessage {
    /// Primary message content, always ending with the relay marker
    pub content: String,

    /// Image URLs to embed, at most `MAX_EMBEDS`
    pub embeds: Vec<String>,

    /// Attachment list sent separately when it does not fit in `content`,
    /// split so that every chunk fits the platform limit
    pub follow_up: Vec<String>,
}

/// Attachments split into embeds and link lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub embeds: Vec<String>,
    pub links: Vec<String>,
}

/// True if the message already carries the relay marker
pub fn is_relayed(content: &str) -> bool {
    content.trim_end().ends_with(RELAY_MARKER)
}

fn image_proxy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://i\d+\.wp\.com/([^?\s]+)(\?[^\s]*)?").expect("valid image proxy pattern")
    })
}

/// Rewrite an image-proxy CDN URL (`i0.wp.com/host/path?...`) to its origin
pub fn unproxy_cdn_url(url: &str) -> String {
    match image_proxy_regex().captures(url) {
        Some(caps) if caps.get(0).map(|m| m.as_str().len()) == Some(url.len()) => {
            format!("https://{}", &caps[1])
        }
        _ => url.to_string(),
    }
}

/// Unproxy image-proxy URLs in free text, only where the target is an image
pub fn rewrite_proxied_image_urls(text: &str) -> String {
    image_proxy_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let path = &caps[1];
            if has_image_extension(path) {
                format!("https://{}", path)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Split attachments into embeds and links.
///
/// Non-spoiler images are embedded in order up to `MAX_EMBEDS`. Everything
/// else becomes a link; spoilers are wrapped in `||...||`.
pub fn plan_attachments(attachments: &[Attachment]) -> AttachmentPlan {
    let mut plan = AttachmentPlan::default();

    for attachment in attachments {
        let spoiler = attachment.is_spoiler();
        if attachment.is_image() && !spoiler && plan.embeds.len() < MAX_EMBEDS {
            plan.embeds.push(attachment.url.clone());
            continue;
        }

        let url = unproxy_cdn_url(&attachment.url);
        if spoiler {
            plan.links.push(format!("||{}||", url));
        } else {
            plan.links.push(url);
        }
    }

    plan
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Append the marker, on its own line when the body contains a link so it
/// does not attach to the URL.
fn with_marker(mut body: String) -> String {
    if contains_url(&body) {
        body.push('\n');
    }
    body.push(RELAY_MARKER);
    body
}

fn links_block(links: &[String]) -> String {
    let lines: Vec<String> = links.iter().map(|link| format!("• {}", link)).collect();
    format!("{}\n{}", ATTACHMENTS_HEADER, lines.join("\n"))
}

/// Pack link lines into marked messages of at most `PLATFORM_MESSAGE_LIMIT`
/// chars. The header opens the first chunk. A single line longer than the
/// limit still gets a chunk of its own.
fn link_chunks(links: &[String]) -> Vec<String> {
    // Newline and marker
    let budget = PLATFORM_MESSAGE_LIMIT - 2;

    let mut chunks = Vec::new();
    let mut current = ATTACHMENTS_HEADER.to_string();
    let mut current_len = current.chars().count();
    let mut has_lines = false;

    for link in links {
        let line = format!("• {}", link);
        let line_len = line.chars().count();
        if has_lines && current_len + 1 + line_len > budget {
            chunks.push(with_marker(std::mem::take(&mut current)));
            current = line;
            current_len = line_len;
        } else {
            current.push('\n');
            current.push_str(&line);
            current_len += 1 + line_len;
        }
        has_lines = true;
    }

    if has_lines {
        chunks.push(with_marker(current));
    }
    chunks
}

/// Shape a (possibly translated) text and its attachments into an outbound message.
pub fn shape(text: &str, attachments: &[Attachment]) -> ShapedMessage {
    let plan = plan_attachments(attachments);

    // Room for a newline and the marker
    let body = truncate_chars(&rewrite_proxied_image_urls(text), PLATFORM_MESSAGE_LIMIT - 2);

    if plan.links.is_empty() {
        return ShapedMessage {
            content: with_marker(body),
            embeds: plan.embeds,
            follow_up: Vec::new(),
        };
    }

    let block = links_block(&plan.links);
    let combined = if body.is_empty() {
        block.clone()
    } else {
        format!("{}\n\n{}", body, block)
    };
    let combined = with_marker(combined);

    if combined.chars().count() <= PLATFORM_MESSAGE_LIMIT {
        return ShapedMessage {
            content: combined,
            embeds: plan.embeds,
            follow_up: Vec::new(),
        };
    }

    ShapedMessage {
        content: with_marker(body),
        embeds: plan.embeds,
        follow_up: link_chunks(&plan.links),
    }
}
