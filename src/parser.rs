use crate::contract::extract_contract_info;
use crate::event::{
    diff_profiles, AccountFlags, Author, Event, FollowChange, FollowMetrics, FollowUser, Mention,
    Payload, Post, PostKind, ProfileMetrics, ProfileSnapshot, ProfileUpdate, ProfileUser,
    PublishedAt, ReceivedAt, UNKNOWN_HANDLE, UNKNOWN_NAME,
};
use crate::timestamp::{normalize, DisplayZone};
use serde_json::Value;

/// Envelope `type` that marks a profile update.
pub const PROFILE_UPDATE_TYPE: &str = "profile.update";

/// Candidate fields for the post body, in priority order.
const TEXT_FIELDS: &[&[&str]] = &[&["body", "text"], &["text"], &["content"]];

/// Longest raw-payload prefix written to the log.
const LOG_PREVIEW_CHARS: usize = 200;

/// Turns raw stream payloads into [`Event`]s.
///
/// Parsing is total: anything that cannot be read as a known structure
/// degrades to a plain-text or unrecognized event instead of failing.
#[derive(Debug, Clone, Default)]
pub struct EventParser {
    zone: DisplayZone,
}

type Matcher = fn(&EventParser, &serde_json::Map<String, Value>) -> Option<Payload>;

impl EventParser {
    pub fn new(zone: DisplayZone) -> Self {
        Self { zone }
    }

    /// Best-effort decode of a binary frame, then [`EventParser::parse`].
    pub fn parse_bytes(&self, raw: &[u8]) -> Event {
        self.parse(&String::from_utf8_lossy(raw))
    }

    pub fn parse(&self, raw: &str) -> Event {
        let received_at = ReceivedAt::now();
        let payload = self.parse_payload(raw, received_at);
        Event {
            payload,
            received_at,
            raw: raw.to_string(),
        }
    }

    fn parse_payload(&self, raw: &str, received_at: ReceivedAt) -> Payload {
        let trimmed = raw.trim_start();
        if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return Payload::PlainText(raw.to_string());
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self
                .parse_value(&value, received_at)
                .unwrap_or_else(|| Payload::PlainText(raw.to_string())),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw = %preview(raw, LOG_PREVIEW_CHARS),
                    "payload is not valid JSON, relaying as plain text"
                );
                Payload::PlainText(raw.to_string())
            }
        }
    }

    /// `None` only for values that carry nothing to relay (JSON `null`).
    fn parse_value(&self, value: &Value, received_at: ReceivedAt) -> Option<Payload> {
        match value {
            Value::Object(object) => Some(self.parse_object(object)),
            Value::Array(items) => Some(Payload::Batch(
                items
                    .iter()
                    .filter_map(|item| {
                        let payload = self.parse_value(item, received_at)?;
                        Some(Event {
                            payload,
                            received_at,
                            raw: item.to_string(),
                        })
                    })
                    .collect(),
            )),
            Value::Null => None,
            Value::String(text) => Some(Payload::PlainText(text.clone())),
            other => Some(Payload::PlainText(other.to_string())),
        }
    }

    fn parse_object(&self, object: &serde_json::Map<String, Value>) -> Payload {
        let matchers: [Matcher; 3] = [
            EventParser::match_post,
            EventParser::match_follow,
            EventParser::match_profile_update,
        ];

        matchers
            .iter()
            .find_map(|matcher| matcher(self, object))
            .unwrap_or_else(|| {
                let dump = serde_json::to_string_pretty(object).unwrap_or_default();
                Payload::Unrecognized(dump)
            })
    }

    fn match_post(&self, object: &serde_json::Map<String, Value>) -> Option<Payload> {
        let tweet = object.get("tweet")?;
        let message_type = str_field(object.get("type")?)?;

        let post_type = str_at(tweet, &["type"]).unwrap_or("TWEET").to_string();
        let text = TEXT_FIELDS
            .iter()
            .find_map(|path| str_at(tweet, path).filter(|t| !t.is_empty()))
            .unwrap_or_default()
            .to_string();
        let contract_info = extract_contract_info(&text);

        let author = tweet.get("author");
        let author = Author {
            handle: author
                .and_then(|a| str_at(a, &["handle"]))
                .unwrap_or(UNKNOWN_HANDLE)
                .to_string(),
            name: author
                .and_then(|a| str_at(a, &["profile", "name"]))
                .unwrap_or(UNKNOWN_NAME)
                .to_string(),
            avatar: author
                .and_then(|a| str_at(a, &["profile", "avatar"]))
                .unwrap_or_default()
                .to_string(),
            bio: author
                .and_then(|a| a.get("profile"))
                .map(description_text)
                .unwrap_or_default(),
        };

        let published_at = tweet
            .get("created_at")
            .and_then(scalar_text)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                let (utc, display) = normalize(&raw, &self.zone);
                if utc.is_none() {
                    tracing::warn!(created_at = %raw, "unrecognized publish time format");
                }
                PublishedAt { raw, utc, display }
            });

        let post = Post {
            message_type: message_type.to_string(),
            post_kind: PostKind::from_wire(&post_type),
            post_type,
            id: tweet.get("id").and_then(scalar_text).unwrap_or_default(),
            text,
            contract_info,
            author,
            published_at,
            media_urls: media_urls(tweet),
            mentions: mentions(tweet),
            reply_to: str_at(tweet, &["reply", "handle"])
                .filter(|h| !h.is_empty())
                .map(str::to_string),
        };

        tracing::debug!(
            id = %post.id,
            author = %post.author.handle,
            contract_hits = post.contract_info.len(),
            "parsed post event"
        );
        Some(Payload::Post(post))
    }

    fn match_follow(&self, object: &serde_json::Map<String, Value>) -> Option<Payload> {
        let user = object.get("user")?;
        let message_type = str_field(object.get("type")?)?;

        let metrics = user
            .get("public_metrics")
            .filter(|m| m.as_object().is_some_and(|m| !m.is_empty()))
            .map(|m| FollowMetrics {
                following_count: u64_at(m, &["following_count"]),
                followers_count: u64_at(m, &["followers_count"]),
                tweet_count: u64_at(m, &["tweet_count"]),
            });

        Some(Payload::Follow(FollowChange {
            message_type: message_type.to_string(),
            user: FollowUser {
                handle: str_at(user, &["handle"]).unwrap_or(UNKNOWN_HANDLE).to_string(),
                name: str_at(user, &["profile", "name"]).unwrap_or(UNKNOWN_NAME).to_string(),
                avatar: str_at(user, &["profile", "avatar"]).unwrap_or_default().to_string(),
                bio: user.get("profile").map(description_text).unwrap_or_default(),
                metrics,
            },
        }))
    }

    fn match_profile_update(&self, object: &serde_json::Map<String, Value>) -> Option<Payload> {
        let message_type = str_field(object.get("type")?)?;
        if message_type != PROFILE_UPDATE_TYPE {
            return None;
        }
        let profile = object.get("profile")?;
        let user = profile.get("user").unwrap_or(&Value::Null);
        let before = profile.get("before").unwrap_or(&Value::Null);

        let after_snapshot = snapshot(user);
        let before_snapshot = snapshot(before);
        let changes = diff_profiles(&before_snapshot, &after_snapshot);

        let metrics = user
            .get("metrics")
            .filter(|m| m.as_object().is_some_and(|m| !m.is_empty()))
            .map(|m| ProfileMetrics {
                tweets: u64_at(m, &["tweets"]),
                friends: u64_at(m, &["friends"]),
                followers: u64_at(m, &["followers"]),
                likes: u64_at(m, &["likes"]),
            });

        let update = ProfileUpdate {
            message_type: message_type.to_string(),
            user: ProfileUser {
                id: user.get("id").and_then(scalar_text).unwrap_or_default(),
                handle: str_at(user, &["handle"]).unwrap_or(UNKNOWN_HANDLE).to_string(),
                avatar: str_at(user, &["profile", "avatar"]).unwrap_or_default().to_string(),
                banner: str_at(user, &["profile", "banner"]).unwrap_or_default().to_string(),
                joined_at: user.get("joined_at").and_then(scalar_text).unwrap_or_default(),
                profile: after_snapshot,
                flags: AccountFlags {
                    private: bool_at(user, "private"),
                    verified: bool_at(user, "verified"),
                    sensitive: bool_at(user, "sensitive"),
                    restricted: bool_at(user, "restricted"),
                },
                metrics,
            },
            before: before_snapshot,
            changes,
        };

        tracing::debug!(
            handle = %update.user.handle,
            changes = update.changes.len(),
            "parsed profile update"
        );
        Some(Payload::Profile(update))
    }
}

fn snapshot(user: &Value) -> ProfileSnapshot {
    ProfileSnapshot {
        name: str_at(user, &["profile", "name"]).unwrap_or(UNKNOWN_NAME).to_string(),
        bio: user.get("profile").map(description_text).unwrap_or_default(),
        location: str_at(user, &["profile", "location"]).unwrap_or_default().to_string(),
        url: str_at(user, &["profile", "url"]).unwrap_or_default().to_string(),
    }
}

fn media_urls(tweet: &Value) -> Vec<String> {
    ["images", "videos"]
        .iter()
        .filter_map(|kind| tweet.get("media")?.get(*kind)?.as_array())
        .flatten()
        .filter_map(|item| str_at(item, &["url"]))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn mentions(tweet: &Value) -> Vec<Mention> {
    let Some(items) = tweet
        .get("body")
        .and_then(|b| b.get("mentions"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let subtweet_author = tweet.get("subtweet").and_then(|s| s.get("author"));

    items
        .iter()
        .filter_map(|mention| {
            let handle = str_at(mention, &["handle"]).filter(|h| !h.is_empty())?;

            let bio = str_at(mention, &["description", "text"])
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    let author = subtweet_author?;
                    if str_at(author, &["handle"]) != Some(handle) {
                        return None;
                    }
                    str_at(author, &["profile", "description", "text"]).filter(|t| !t.is_empty())
                })
                .map(str::to_string);

            let contract_info = bio
                .as_deref()
                .map(extract_contract_info)
                .unwrap_or_default();
            if !contract_info.is_empty() {
                tracing::debug!(
                    handle,
                    hits = contract_info.len(),
                    "mentioned user bio carries contract info"
                );
            }

            Some(Mention {
                handle: handle.to_string(),
                bio,
                contract_info,
            })
        })
        .collect()
}

/// Walk a path of object keys and return the string at the end.
fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))?
        .as_str()
}

fn str_field(value: &Value) -> Option<&str> {
    value.as_str()
}

fn u64_at(value: &Value, path: &[&str]) -> u64 {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
        .unwrap_or(0)
}

fn bool_at(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Strings and numbers as text; anything else is absent.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Profile descriptions arrive either as `{"text": ...}` or as a bare string.
fn description_text(profile: &Value) -> String {
    match profile.get("description") {
        Some(Value::String(text)) => text.clone(),
        Some(description) => str_at(description, &["text"]).unwrap_or_default().to_string(),
        None => String::new(),
    }
}

/// At most `max_chars` characters of `text`, cut on a char boundary.
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
