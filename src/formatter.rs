use crate::delivery::DeliveryMessage;
use crate::event::{Event, FollowChange, Payload, Post, PostKind, ProfileUpdate};
use crate::parser::preview;
use crate::timestamp::DisplayZone;
use regex::Regex;
use std::sync::OnceLock;

/// `writeln!` for a `String` body, which cannot fail.
macro_rules! push_line {
    ($out:expr, $($arg:tt)*) => {{
        $out.push_str(&format!($($arg)*));
        $out.push('\n');
    }};
}

/// Appended to every truncated body.
pub const ELLIPSIS: &str = "...";

/// Characters given up below the hard cap when a body is truncated.
pub const TRUNCATION_HEADROOM: usize = 100;

/// Bio and batch-item previews are cut to this many characters.
const PREVIEW_CHARS: usize = 100;

const FOLLOW_TITLES: &[(&str, &str, &str)] = &[
    ("following.create", "➕", "New Following"),
    ("following.update", "🔄", "Following Updated"),
    ("following.delete", "➖", "Unfollowed"),
    ("follower.create", "👤", "New Follower"),
    ("follower.update", "🔄", "Follower Updated"),
    ("follower.delete", "👋", "Follower Lost"),
];
const FOLLOW_FALLBACK: (&str, &str) = ("📡", "Follow Change");

const PROFILE_TITLES: &[(&str, &str, &str)] = &[("profile.update", "👤", "Profile Update")];
const PROFILE_FALLBACK: (&str, &str) = ("📝", "Profile Change");

fn lookup_title(
    table: &[(&str, &'static str, &'static str)],
    key: &str,
    fallback: (&'static str, &'static str),
) -> (&'static str, &'static str) {
    table
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, emoji, title)| (*emoji, *title))
        .unwrap_or(fallback)
}

fn post_emoji(kind: PostKind) -> &'static str {
    match kind {
        PostKind::Created => "📝",
        PostKind::Reply => "💬",
        PostKind::Retweet => "🔄",
        PostKind::Quote => "💭",
    }
}

fn twitter_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)https?://(?:www\.)?(?:twitter\.com|t\.co|x\.com)")
            .expect("static twitter link pattern")
    })
}

/// Whether free text links to a tweet or profile.
pub fn mentions_twitter(text: &str) -> bool {
    twitter_link_pattern().is_match(text)
}

/// Escape the three characters the chat HTML dialect reserves.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Enforce the hard cap on a rendered body.
///
/// Bodies over `max_length` characters keep their first
/// `max_length - TRUNCATION_HEADROOM` characters plus [`ELLIPSIS`]. The cut
/// moves left rather than land inside an entity, a tag, or an open `<b>`.
pub fn truncate_body(body: String, max_length: usize) -> String {
    if body.chars().count() <= max_length {
        return body;
    }
    let keep = max_length.saturating_sub(TRUNCATION_HEADROOM);
    let cut = body
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    let cut = markup_safe_cut(&body, cut);

    let mut truncated = String::with_capacity(cut + ELLIPSIS.len());
    truncated.push_str(&body[..cut]);
    truncated.push_str(ELLIPSIS);
    truncated
}

fn markup_safe_cut(body: &str, mut cut: usize) -> usize {
    if let Some(amp) = body[..cut].rfind('&') {
        if !body[amp..cut].contains(';') {
            cut = amp;
        }
    }
    if let Some(lt) = body[..cut].rfind('<') {
        if !body[lt..cut].contains('>') {
            cut = lt;
        }
    }
    if let Some(open) = body[..cut].rfind("<b>") {
        if !body[open..cut].contains("</b>") {
            cut = open;
        }
    }
    cut
}

/// Renders events into chat messages.
#[derive(Debug, Clone)]
pub struct Formatter {
    max_message_length: usize,
    batch_display_size: usize,
    zone: DisplayZone,
}

impl Formatter {
    pub fn new(max_message_length: usize, batch_display_size: usize, zone: DisplayZone) -> Self {
        Self {
            max_message_length,
            batch_display_size,
            zone,
        }
    }

    /// `None` only for an empty batch.
    pub fn format(&self, event: &Event) -> Option<DeliveryMessage> {
        let message = match &event.payload {
            Payload::Post(post) => {
                let body = self.finish(self.render_post(post));
                match post.media_urls.first() {
                    Some(image_url) => DeliveryMessage::TextWithImage {
                        body,
                        image_url: image_url.clone(),
                    },
                    None => DeliveryMessage::Text { body },
                }
            }
            Payload::Follow(follow) => DeliveryMessage::Text {
                body: self.finish(self.render_follow(follow, event)),
            },
            Payload::Profile(update) => DeliveryMessage::Text {
                body: self.finish(self.render_profile(update, event)),
            },
            Payload::PlainText(text) => {
                let header = if mentions_twitter(text) {
                    "🐦 <b>Twitter Message</b>"
                } else {
                    "💬 <b>Message</b>"
                };
                DeliveryMessage::Text {
                    body: self.finish(format!("{}\n\n{}", header, escape_html(text))),
                }
            }
            Payload::Unrecognized(dump) => DeliveryMessage::Text {
                body: self.finish(format!("📄 <b>Data Message</b>\n\n{}", escape_html(dump))),
            },
            Payload::Batch(items) => {
                if items.is_empty() {
                    return None;
                }
                DeliveryMessage::Text {
                    body: self.finish(self.render_batch(items)),
                }
            }
        };
        Some(message)
    }

    fn finish(&self, body: String) -> String {
        truncate_body(body, self.max_message_length)
    }

    fn render_post(&self, post: &Post) -> String {
        let emoji = post_emoji(post.post_kind);
        let mut out = String::new();

        push_line!(out, "{} <b>Tweet Update</b>\n", emoji);
        push_line!(out, "<b>Type:</b> {} {}", emoji, escape_html(&post.post_type));
        push_line!(out, "<b>Handle:</b> @{}", escape_html(&post.author.handle));
        if !post.author.name.is_empty() {
            push_line!(out, "<b>Name:</b> {}", escape_html(&post.author.name));
        }
        if post.post_kind == PostKind::Reply {
            if let Some(reply_to) = &post.reply_to {
                push_line!(out, "<b>Reply to:</b> @{}", escape_html(reply_to));
            }
        }
        if !post.text.is_empty() {
            push_line!(out, "<b>Text:</b> {}", escape_html(&post.text));
        }

        if !post.contract_info.is_empty() {
            out.push_str("\n<b>🔗 CA:</b>\n");
            for info in &post.contract_info {
                push_line!(out, "• {}", escape_html(&info.to_string()));
            }
        }

        if !post.mentions.is_empty() {
            let handles: Vec<String> = post
                .mentions
                .iter()
                .map(|m| format!("@{}", escape_html(&m.handle)))
                .collect();
            push_line!(out, "<b>Mentions:</b> {}", handles.join(", "));
        }

        let flagged: Vec<_> = post.mentions_with_contract_info().collect();
        if !flagged.is_empty() {
            out.push_str("\n<b>🔗 Mentioned CA:</b>\n");
            for mention in flagged {
                push_line!(out, "• <b>@{}</b>", escape_html(&mention.handle));
                let bio = mention.bio.as_deref().unwrap_or_default();
                push_line!(out, "  Bio: {}...", escape_html(preview(bio, PREVIEW_CHARS)));
                for info in &mention.contract_info {
                    push_line!(out, "  {}", escape_html(&info.to_string()));
                }
                out.push('\n');
            }
        }

        push_line!(out, "<b>Link:</b> {}", escape_html(&post.url()));
        if let Some(published) = &post.published_at {
            push_line!(out, "<b>Published:</b> {}", escape_html(&published.display));
        }
        if !post.media_urls.is_empty() {
            push_line!(out, "<b>Media:</b> {} file(s)", post.media_urls.len());
        }
        out
    }

    fn render_follow(&self, follow: &FollowChange, event: &Event) -> String {
        let (emoji, title) = lookup_title(FOLLOW_TITLES, &follow.message_type, FOLLOW_FALLBACK);
        let user = &follow.user;
        let mut out = String::new();

        push_line!(out, "{} <b>{}</b>\n", emoji, title);
        push_line!(out, "<b>Handle:</b> @{}", escape_html(&user.handle));
        if !user.name.is_empty() {
            push_line!(out, "<b>Name:</b> {}", escape_html(&user.name));
        }
        if !user.bio.is_empty() {
            push_line!(out, "<b>Bio:</b> {}...", escape_html(preview(&user.bio, PREVIEW_CHARS)));
        }
        if let Some(metrics) = &user.metrics {
            push_line!(out, "<b>Following:</b> {}", metrics.following_count);
            push_line!(out, "<b>Followers:</b> {}", metrics.followers_count);
            push_line!(out, "<b>Tweets:</b> {}", metrics.tweet_count);
        }
        push_line!(out, "<b>Profile:</b> https://x.com/{}", escape_html(&user.handle));
        push_line!(out, "<b>Time:</b> {}", self.zone.render(&event.received_at.wall));
        out
    }

    fn render_profile(&self, update: &ProfileUpdate, event: &Event) -> String {
        let (emoji, title) = lookup_title(PROFILE_TITLES, &update.message_type, PROFILE_FALLBACK);
        let user = &update.user;
        let profile = &user.profile;
        let mut out = String::new();

        push_line!(out, "{} <b>{}</b>\n", emoji, title);
        push_line!(out, "<b>Handle:</b> @{}", escape_html(&user.handle));
        if !profile.name.is_empty() {
            push_line!(out, "<b>Name:</b> {}", escape_html(&profile.name));
        }
        if !profile.bio.is_empty() {
            push_line!(out, "<b>Bio:</b> {}...", escape_html(preview(&profile.bio, PREVIEW_CHARS)));
        }
        if !profile.location.is_empty() {
            push_line!(out, "<b>Location:</b> {}", escape_html(&profile.location));
        }
        if let Some(metrics) = &user.metrics {
            push_line!(out, "<b>Tweets:</b> {}", metrics.tweets);
            push_line!(out, "<b>Following:</b> {}", metrics.friends);
            push_line!(out, "<b>Followers:</b> {}", metrics.followers);
            push_line!(out, "<b>Likes:</b> {}", metrics.likes);
        }

        let flags = &user.flags;
        let badges: Vec<&str> = [
            (flags.verified, "✅ Verified"),
            (flags.private, "🔒 Private"),
            (flags.sensitive, "⚠️ Sensitive"),
            (flags.restricted, "🚫 Restricted"),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .map(|(_, badge)| badge)
        .collect();
        if !badges.is_empty() {
            push_line!(out, "<b>Status:</b> {}", badges.join(", "));
        }

        if update.changes.is_empty() {
            out.push_str("\n<b>📝 Changes:</b> none\n");
        } else {
            out.push_str("\n<b>📝 Changes:</b>\n");
            for change in &update.changes {
                push_line!(
                    out,
                    "• {}: {} → {}",
                    change.field.label(),
                    escape_html(&change.before),
                    escape_html(&change.after)
                );
            }
        }

        push_line!(out, "<b>Profile:</b> https://x.com/{}", escape_html(&user.handle));
        push_line!(out, "<b>Time:</b> {}", self.zone.render(&event.received_at.wall));
        out
    }

    fn render_batch(&self, items: &[Event]) -> String {
        let mut out = String::from("📦 <b>Batch</b>\n\n");

        for (i, item) in items.iter().take(self.batch_display_size).enumerate() {
            let n = i + 1;
            let entry = match &item.payload {
                Payload::Post(post) => format!(
                    "{}. @{}: {}...",
                    n,
                    escape_html(&post.author.handle),
                    escape_html(preview(&post.text, PREVIEW_CHARS))
                ),
                Payload::Profile(update) => {
                    format!("{}. @{}: profile update...", n, escape_html(&update.user.handle))
                }
                Payload::Follow(follow) => {
                    let (_, title) =
                        lookup_title(FOLLOW_TITLES, &follow.message_type, FOLLOW_FALLBACK);
                    format!("{}. @{}: {}...", n, escape_html(&follow.user.handle), title)
                }
                Payload::PlainText(text) | Payload::Unrecognized(text) => {
                    format!("{}. {}...", n, escape_html(preview(text, PREVIEW_CHARS)))
                }
                Payload::Batch(inner) => format!("{}. batch of {} message(s)...", n, inner.len()),
            };
            push_line!(out, "{}", entry);
        }

        if items.len() > self.batch_display_size {
            out.push_str(&format!(
                "\n... and {} more message(s)",
                items.len() - self.batch_display_size
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::EventParser;

    const MAX_LEN: usize = 4096;

    fn formatter() -> Formatter {
        Formatter::new(MAX_LEN, 5, DisplayZone::Named(chrono_tz::UTC))
    }

    fn render(raw: &str) -> Option<DeliveryMessage> {
        let parser = EventParser::new(DisplayZone::Named(chrono_tz::UTC));
        formatter().format(&parser.parse(raw))
    }

    fn body(raw: &str) -> String {
        render(raw).expect("message").body().to_string()
    }

    #[test]
    fn test_end_to_end_minimal_post() {
        let raw = r#"{"tweet":{"type":"TWEET","author":{"handle":"alice"},"body":{"text":"gm"}},"type":"tweet.create"}"#;
        let message = render(raw).unwrap();
        assert!(matches!(message, DeliveryMessage::Text { .. }));
        assert!(message.body().contains("@alice"));
        assert!(message.body().contains("gm"));
        assert!(message.body().contains("https://x.com/alice/status/"));
    }

    #[test]
    fn test_post_with_media_uses_first_image() {
        let raw = r#"{"type":"tweet.create","tweet":{"id":"42","author":{"handle":"bob"},"text":"look","media":{"images":[{"url":"https://img/1.jpg"},{"url":"https://img/2.jpg"}]}}}"#;
        let message = render(raw).unwrap();
        assert_eq!(message.image_url(), Some("https://img/1.jpg"));
        assert!(message.body().contains("https://x.com/bob/status/42"));
        assert!(message.body().contains("<b>Media:</b> 2 file(s)"));
    }

    #[test]
    fn test_reply_post_renders_target_and_contracts() {
        let raw = r#"{"type":"tweet.create","tweet":{"id":"7","type":"REPLY","reply":{"handle":"carol"},"author":{"handle":"dan","profile":{"name":"Dan"}},"body":{"text":"CA: 0x52908400098527886E0F7030069857D2E4169EE7","mentions":[{"handle":"erin","description":{"text":"Contract Address inside"}}]}}}"#;
        let body = body(raw);
        assert!(body.starts_with("💬 <b>Tweet Update</b>"));
        assert!(body.contains("<b>Reply to:</b> @carol"));
        assert!(body.contains("<b>Name:</b> Dan"));
        assert!(body.contains("• 🔷 Ethereum: `0x52908400098527886E0F7030069857D2E4169EE7`"));
        assert!(body.contains("<b>Mentions:</b> @erin"));
        assert!(body.contains("• <b>@erin</b>\n  Bio: Contract Address inside..."));
    }

    #[test]
    fn test_user_text_is_escaped() {
        let raw = r#"{"type":"tweet.create","tweet":{"author":{"handle":"eve"},"text":"1 < 2 & <i>x</i>"}}"#;
        let body = body(raw);
        assert!(body.contains("1 &lt; 2 &amp; &lt;i&gt;x&lt;/i&gt;"));
        assert!(!body.contains("<i>"));
    }

    #[test]
    fn test_follow_titles_and_fallback() {
        let known = body(r#"{"type":"follower.delete","user":{"handle":"f"}}"#);
        assert!(known.starts_with("👋 <b>Follower Lost</b>"));
        let unknown = body(r#"{"type":"follower.mystery","user":{"handle":"f"}}"#);
        assert!(unknown.starts_with("📡 <b>Follow Change</b>"));
        assert!(unknown.contains("<b>Profile:</b> https://x.com/f"));
    }

    #[test]
    fn test_follow_metrics_rendered() {
        let body = body(
            r#"{"type":"following.create","user":{"handle":"g","public_metrics":{"following_count":1,"followers_count":2,"tweet_count":3}}}"#,
        );
        assert!(body.contains("<b>Following:</b> 1\n<b>Followers:</b> 2\n<b>Tweets:</b> 3"));
    }

    #[test]
    fn test_every_field_gets_its_own_line() {
        let follow = body(
            r#"{"type":"following.create","user":{"handle":"g","profile":{"name":"Gee"},"public_metrics":{"following_count":1,"followers_count":2,"tweet_count":3}}}"#,
        );
        assert!(follow.starts_with(
            "➕ <b>New Following</b>\n\n<b>Handle:</b> @g\n<b>Name:</b> Gee\n"
        ));
        assert!(follow.contains("<b>Tweets:</b> 3\n<b>Profile:</b> https://x.com/g\n<b>Time:</b> "));

        let batch = body(
            r#"[{"type":"t","tweet":{"author":{"handle":"a"},"text":"x"}},{"type":"t","tweet":{"author":{"handle":"b"},"text":"y"}}]"#,
        );
        assert_eq!(batch, "📦 <b>Batch</b>\n\n1. @a: x...\n2. @b: y...\n");
    }

    #[test]
    fn test_profile_update_changes_and_badges() {
        let raw = r#"{"type":"profile.update","profile":{"user":{"handle":"h","verified":true,"private":true,"profile":{"name":"B"}},"before":{"profile":{"name":"A"}}}}"#;
        let rendered = body(raw);
        assert!(rendered.starts_with("👤 <b>Profile Update</b>"));
        assert!(rendered.contains("• Name: A → B"));
        assert!(rendered.contains("<b>Status:</b> ✅ Verified, 🔒 Private"));

        let unchanged = r#"{"type":"profile.update","profile":{"user":{"handle":"h"},"before":{}}}"#;
        assert!(body(unchanged).contains("<b>📝 Changes:</b> none"));
    }

    #[test]
    fn test_plain_text_headers() {
        assert!(body("hello there").starts_with("💬 <b>Message</b>\n\nhello there"));
        assert!(body("see https://x.com/a/status/1").starts_with("🐦 <b>Twitter Message</b>"));
    }

    #[test]
    fn test_unrecognized_object_dump() {
        let body = body(r#"{"foo":"<bar>"}"#);
        assert!(body.starts_with("📄 <b>Data Message</b>"));
        assert!(body.contains("&lt;bar&gt;"));
    }

    #[test]
    fn test_empty_batch_produces_nothing() {
        assert!(render("[]").is_none());
        assert!(render("[null, null]").is_none());
    }

    #[test]
    fn test_batch_shows_first_five_in_order() {
        let items: Vec<String> = (1..=7)
            .map(|i| format!(r#"{{"type":"t","tweet":{{"author":{{"handle":"u{}"}},"text":"m{}"}}}}"#, i, i))
            .collect();
        let raw = format!("[{}]", items.join(","));
        let body = body(&raw);
        assert!(body.starts_with("📦 <b>Batch</b>"));
        assert!(body.contains("1. @u1: m1..."));
        assert!(body.contains("5. @u5: m5..."));
        assert!(!body.contains("@u6"));
        assert!(body.ends_with("... and 2 more message(s)"));
    }

    #[test]
    fn test_truncation_law() {
        let long = "a".repeat(MAX_LEN * 2);
        let body = body(&long);
        assert_eq!(
            body.chars().count(),
            MAX_LEN - TRUNCATION_HEADROOM + ELLIPSIS.chars().count()
        );
        assert!(body.ends_with(ELLIPSIS));
    }

    #[test]
    fn test_short_body_is_untouched() {
        assert_eq!(truncate_body("short".to_string(), 200), "short");
    }

    #[test]
    fn test_truncation_never_splits_an_entity() {
        // 120 chars with an entity straddling the 20-char cut point.
        let body = format!("{}&amp;{}", "x".repeat(18), "y".repeat(100));
        let truncated = truncate_body(body, 120);
        assert_eq!(truncated, format!("{}{}", "x".repeat(18), ELLIPSIS));
    }

    #[test]
    fn test_truncation_never_leaves_open_bold() {
        let body = format!("{}<b>label</b>{}", "x".repeat(15), "y".repeat(120));
        let truncated = truncate_body(body, 120);
        assert_eq!(truncated, format!("{}{}", "x".repeat(15), ELLIPSIS));
    }
}
