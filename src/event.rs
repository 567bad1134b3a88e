//! Nostr event model.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Profile metadata (NIP-01).
pub const KIND_METADATA: u32 = 0;
/// Short text note (NIP-01).
pub const KIND_TEXT_NOTE: u32 = 1;
/// Reaction (NIP-25).
pub const KIND_REACTION: u32 = 7;
/// Remote signing request and response (NIP-46).
pub const KIND_NOSTR_CONNECT: u32 = 24133;
/// Wallet-connect request (NIP-47).
pub const KIND_WALLET_REQUEST: u32 = 23194;
/// Wallet-connect response (NIP-47).
pub const KIND_WALLET_RESPONSE: u32 = 23195;
/// Zap request (NIP-57).
pub const KIND_ZAP_REQUEST: u32 = 9734;
/// Follow set / people list (NIP-51).
pub const KIND_PEOPLE_LIST: u32 = 30000;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The ones this crate reads or writes:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – list identifier on replaceable lists
/// - `amount` / `relays` – zap request parameters
/// - `emoji` – custom emoji shortcode and image URL
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string-like parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name, e.g. `p`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "f1e2...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["p", "ab12..."]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `9734`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Compact JSON form, as sent in query strings and signer requests.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event fields prior to signing. The remote signer receives this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Template stamped with the current time.
    pub fn new(pubkey: impl Into<String>, kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            kind,
            created_at: unix_now(),
            tags,
            content: content.into(),
        }
    }

    /// Canonical NIP-01 hash of the template.
    pub fn hash(&self) -> Result<[u8; 32]> {
        canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

/// Subscription filter sent inside `REQ` messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub e: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn event_refs<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.e = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn pubkey_refs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.p = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `ev` satisfies every populated field.
    pub fn matches(&self, ev: &Event) -> bool {
        let tag_match = |name: &str, wanted: &Option<Vec<String>>| {
            wanted.as_ref().map_or(true, |vals| {
                ev.tag_values(name).any(|v| vals.iter().any(|w| w == v))
            })
        };
        self.ids.as_ref().map_or(true, |ids| ids.contains(&ev.id))
            && self.authors.as_ref().map_or(true, |a| a.contains(&ev.pubkey))
            && self.kinds.as_ref().map_or(true, |k| k.contains(&ev.kind))
            && self.since.map_or(true, |s| ev.created_at >= s)
            && tag_match("e", &self.e)
            && tag_match("p", &self.p)
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn canonical_hash(pubkey: &str, created_at: u64, kind: u32, tags: &[Tag], content: &str) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    canonical_hash(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let msg = Message::from_digest_slice(&hash)?;
    SECP256K1.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
