use crate::contract::ContractInfo;
use chrono::{DateTime, Local, Utc};
use std::time::Instant;

pub const UNKNOWN_HANDLE: &str = "unknown";
pub const UNKNOWN_NAME: &str = "Unknown";

/// One normalized inbound notification.
///
/// Built once by the parser and handed to the formatter; never mutated.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: Payload,
    pub received_at: ReceivedAt,
    /// The payload exactly as it arrived, kept for diagnostics.
    pub raw: String,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PostCreated,
    PostReply,
    PostRetweet,
    PostQuote,
    FollowChanged,
    ProfileUpdated,
    PlainText,
    Batch,
    Unrecognized,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Post(Post),
    Follow(FollowChange),
    Profile(ProfileUpdate),
    PlainText(String),
    Batch(Vec<Event>),
    /// A structured object no matcher recognized, pretty-printed.
    Unrecognized(String),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Post(post) => match post.post_kind {
                PostKind::Created => EventKind::PostCreated,
                PostKind::Reply => EventKind::PostReply,
                PostKind::Retweet => EventKind::PostRetweet,
                PostKind::Quote => EventKind::PostQuote,
            },
            Payload::Follow(_) => EventKind::FollowChanged,
            Payload::Profile(_) => EventKind::ProfileUpdated,
            Payload::PlainText(_) => EventKind::PlainText,
            Payload::Batch(_) => EventKind::Batch,
            Payload::Unrecognized(_) => EventKind::Unrecognized,
        }
    }
}

/// Ingestion time as both a monotonic instant and a wall-clock reading.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedAt {
    pub instant: Instant,
    pub wall: DateTime<Local>,
}

impl ReceivedAt {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Created,
    Reply,
    Retweet,
    Quote,
}

impl PostKind {
    /// Unknown post types are treated as plain posts.
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "REPLY" => PostKind::Reply,
            "RETWEET" => PostKind::Retweet,
            "QUOTE" => PostKind::Quote,
            _ => PostKind::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub handle: String,
    pub name: String,
    pub avatar: String,
    pub bio: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub handle: String,
    pub bio: Option<String>,
    pub contract_info: Vec<ContractInfo>,
}

impl Mention {
    pub fn has_contract_info(&self) -> bool {
        !self.contract_info.is_empty()
    }
}

/// Original publish time of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedAt {
    pub raw: String,
    pub utc: Option<DateTime<Utc>>,
    /// Normalized to the display zone, or the raw text when nothing parsed.
    pub display: String,
}

#[derive(Debug, Clone)]
pub struct Post {
    /// Outer envelope type, e.g. `tweet.create`.
    pub message_type: String,
    /// Post type exactly as sent, e.g. `TWEET` or `REPLY`.
    pub post_type: String,
    pub post_kind: PostKind,
    pub id: String,
    pub text: String,
    pub contract_info: Vec<ContractInfo>,
    pub author: Author,
    pub published_at: Option<PublishedAt>,
    pub media_urls: Vec<String>,
    pub mentions: Vec<Mention>,
    pub reply_to: Option<String>,
}

impl Post {
    pub fn url(&self) -> String {
        format!("https://x.com/{}/status/{}", self.author.handle, self.id)
    }

    pub fn mentions_with_contract_info(&self) -> impl Iterator<Item = &Mention> {
        self.mentions.iter().filter(|m| m.has_contract_info())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowMetrics {
    pub following_count: u64,
    pub followers_count: u64,
    pub tweet_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUser {
    pub handle: String,
    pub name: String,
    pub avatar: String,
    pub bio: String,
    pub metrics: Option<FollowMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowChange {
    /// Sub-type such as `following.create` or `follower.delete`.
    pub message_type: String,
    pub user: FollowUser,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileMetrics {
    pub tweets: u64,
    pub friends: u64,
    pub followers: u64,
    pub likes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountFlags {
    pub private: bool,
    pub verified: bool,
    pub sensitive: bool,
    pub restricted: bool,
}

/// The diffable part of a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub name: String,
    pub bio: String,
    pub location: String,
    pub url: String,
}

impl Default for ProfileSnapshot {
    fn default() -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            bio: String::new(),
            location: String::new(),
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUser {
    pub id: String,
    pub handle: String,
    pub avatar: String,
    pub banner: String,
    pub joined_at: String,
    pub profile: ProfileSnapshot,
    pub flags: AccountFlags,
    pub metrics: Option<ProfileMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Name,
    Bio,
    Location,
    Url,
}

impl ProfileField {
    pub fn label(self) -> &'static str {
        match self {
            ProfileField::Name => "Name",
            ProfileField::Bio => "Bio",
            ProfileField::Location => "Location",
            ProfileField::Url => "URL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileChange {
    pub field: ProfileField,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub message_type: String,
    pub user: ProfileUser,
    pub before: ProfileSnapshot,
    pub changes: Vec<ProfileChange>,
}

/// Field-by-field exact comparison of two profile snapshots.
pub fn diff_profiles(before: &ProfileSnapshot, after: &ProfileSnapshot) -> Vec<ProfileChange> {
    let fields = [
        (ProfileField::Name, &before.name, &after.name),
        (ProfileField::Bio, &before.bio, &after.bio),
        (ProfileField::Location, &before.location, &after.location),
        (ProfileField::Url, &before.url, &after.url),
    ];

    fields
        .into_iter()
        .filter(|(_, old, new)| old != new)
        .map(|(field, old, new)| ProfileChange {
            field,
            before: old.clone(),
            after: new.clone(),
        })
        .collect()
}
