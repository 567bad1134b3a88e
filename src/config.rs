//! Configuration loading from `.env` files.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};

use crate::keys::normalize_pubkey;
use crate::signer::BunkerUrl;
use crate::wallet::NwcUrl;

const DEFAULT_KEEPALIVE_SECS: u64 = 4 * 60 * 60;
/// Total bitcoin supply in sats.
const MAX_ZAP_SATS: u64 = 21_000_000 * 100_000_000;

/// Custom emoji attached to reactions (NIP-30).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEmoji {
    /// Shortcode without the surrounding colons.
    pub name: String,
    /// Image URL.
    pub url: String,
}

/// Runtime settings derived from environment variables.
#[derive(Clone, Default)]
pub struct Settings {
    /// Relays used for intake, profile lookup, reactions and list fetches.
    pub relays: Vec<String>,
    /// Monitoring identity as hex, empty when unset.
    pub author: String,
    /// `bunker://` URL of the remote signer (NIP-46).
    pub bunker_url: String,
    /// `nostr+walletconnect://` URL of the paying wallet (NIP-47).
    pub nwc_url: String,
    /// Directly monitored authors as hex.
    pub monitored: Vec<String>,
    /// `d` identifier of the people list to monitor.
    pub selected_list: Option<String>,
    /// Sats per zap.
    pub zap_amount: u64,
    /// Content of every zap request.
    pub zap_comment: String,
    /// Sats per UTC day across all authors.
    pub daily_limit: u64,
    /// Sats per UTC day for a single author.
    pub per_author_limit: u64,
    /// Publish a reaction alongside each zap.
    pub reaction_enabled: bool,
    /// Reaction content, e.g. `+` or `:zap:`.
    pub reaction_content: String,
    /// Emoji tag referenced by a `:shortcode:` reaction.
    pub reaction_emoji: Option<CustomEmoji>,
    /// SQLite ledger location.
    pub db_path: PathBuf,
    /// Persisted signing-session secret.
    pub session_key_path: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Interval between signer pings.
    pub bunker_keepalive: Duration,
    /// Verify Schnorr signatures of incoming notes.
    pub verify_sig: bool,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    ///
    /// Only malformed values fail here; completeness is checked by
    /// [`Settings::validate`].
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let base = env_dir(Path::new(path));
        let author = match non_empty("AUTHOR_NPUB") {
            Some(v) => normalize_pubkey(&v).with_context(|| format!("invalid AUTHOR_NPUB {v}"))?,
            None => String::new(),
        };
        let monitored = csv_strings(env::var("MONITORED").unwrap_or_default())
            .iter()
            .map(|v| normalize_pubkey(v).with_context(|| format!("invalid MONITORED entry {v}")))
            .collect::<Result<Vec<_>>>()?;
        let daily_limit = parse_u64("DAILY_LIMIT")?.unwrap_or(0);
        let reaction_emoji = match (non_empty("REACTION_EMOJI_NAME"), non_empty("REACTION_EMOJI_URL")) {
            (Some(name), Some(url)) => Some(CustomEmoji { name, url }),
            (None, None) => None,
            _ => bail!("REACTION_EMOJI_NAME and REACTION_EMOJI_URL must be set together"),
        };
        Ok(Self {
            relays: csv_strings(env::var("RELAYS").unwrap_or_default()),
            author,
            bunker_url: env::var("BUNKER_URL").unwrap_or_default(),
            nwc_url: env::var("NWC_URL").unwrap_or_default(),
            monitored,
            selected_list: non_empty("SELECTED_LIST"),
            zap_amount: parse_u64("ZAP_AMOUNT")?.unwrap_or(0),
            zap_comment: env::var("ZAP_COMMENT").unwrap_or_default(),
            daily_limit,
            per_author_limit: parse_u64("PER_AUTHOR_LIMIT")?.unwrap_or(daily_limit),
            reaction_enabled: parse_bool("REACTION_ENABLED"),
            reaction_content: env::var("REACTION_CONTENT").unwrap_or_default(),
            reaction_emoji,
            db_path: non_empty("DB_PATH").map_or_else(|| base.join("zapwatch.db"), PathBuf::from),
            session_key_path: non_empty("SESSION_KEY_PATH").map_or_else(|| base.join("session.key"), PathBuf::from),
            tor_socks: non_empty("TOR_SOCKS"),
            bunker_keepalive: Duration::from_secs(parse_u64("BUNKER_KEEPALIVE_SECS")?.unwrap_or(DEFAULT_KEEPALIVE_SECS)),
            verify_sig: env::var("VERIFY_SIG").map_or(true, |v| v != "0"),
        })
    }

    /// Check everything `start` needs.
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            bail!("RELAYS must list at least one relay");
        }
        if self.author.is_empty() {
            bail!("AUTHOR_NPUB is required");
        }
        BunkerUrl::parse(&self.bunker_url).context("invalid BUNKER_URL")?;
        NwcUrl::parse(&self.nwc_url).context("invalid NWC_URL")?;
        if self.monitored.is_empty() && self.selected_list.is_none() {
            bail!("set MONITORED or SELECTED_LIST");
        }
        if self.zap_amount == 0 {
            bail!("ZAP_AMOUNT must be positive");
        }
        if self.zap_amount > MAX_ZAP_SATS {
            bail!("ZAP_AMOUNT exceeds {MAX_ZAP_SATS} sats");
        }
        if self.daily_limit == 0 {
            bail!("DAILY_LIMIT must be positive");
        }
        if self.per_author_limit == 0 {
            bail!("PER_AUTHOR_LIMIT must be positive");
        }
        if self.reaction_enabled && self.reaction_content.is_empty() {
            bail!("REACTION_CONTENT is required when reactions are enabled");
        }
        if self.bunker_keepalive.is_zero() {
            bail!("BUNKER_KEEPALIVE_SECS must be positive");
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("relays", &self.relays)
            .field("author", &self.author)
            .field("bunker_url", &mask_secret(&self.bunker_url))
            .field("nwc_url", &mask_secret(&self.nwc_url))
            .field("monitored", &self.monitored.len())
            .field("selected_list", &self.selected_list)
            .field("zap_amount", &self.zap_amount)
            .field("daily_limit", &self.daily_limit)
            .field("per_author_limit", &self.per_author_limit)
            .field("reaction_enabled", &self.reaction_enabled)
            .finish_non_exhaustive()
    }
}

/// `KEY=value` listing with secrets masked.
impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let emoji = self
            .reaction_emoji
            .as_ref()
            .map_or_else(String::new, |e| format!("{} {}", e.name, e.url));
        writeln!(f, "RELAYS={}", self.relays.join(","))?;
        writeln!(f, "AUTHOR_NPUB={}", self.author)?;
        writeln!(f, "BUNKER_URL={}", mask_secret(&self.bunker_url))?;
        writeln!(f, "NWC_URL={}", mask_secret(&self.nwc_url))?;
        writeln!(f, "MONITORED={}", self.monitored.join(","))?;
        writeln!(f, "SELECTED_LIST={}", self.selected_list.as_deref().unwrap_or_default())?;
        writeln!(f, "ZAP_AMOUNT={}", self.zap_amount)?;
        writeln!(f, "ZAP_COMMENT={}", self.zap_comment)?;
        writeln!(f, "DAILY_LIMIT={}", self.daily_limit)?;
        writeln!(f, "PER_AUTHOR_LIMIT={}", self.per_author_limit)?;
        writeln!(f, "REACTION_ENABLED={}", self.reaction_enabled)?;
        writeln!(f, "REACTION_CONTENT={}", self.reaction_content)?;
        writeln!(f, "REACTION_EMOJI={emoji}")?;
        writeln!(f, "DB_PATH={}", self.db_path.display())?;
        writeln!(f, "SESSION_KEY_PATH={}", self.session_key_path.display())?;
        writeln!(f, "TOR_SOCKS={}", self.tor_socks.as_deref().unwrap_or_default())?;
        writeln!(f, "BUNKER_KEEPALIVE_SECS={}", self.bunker_keepalive.as_secs())?;
        write!(f, "VERIFY_SIG={}", u8::from(self.verify_sig))
    }
}

/// Replace the value of every `secret=` query parameter with `***`.
pub fn mask_secret(url: &str) -> String {
    let Some((head, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some(("secret", _)) => "secret=***".to_string(),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{head}?{query}")
}

/// Directory holding the env file, falling back to the working directory.
pub fn env_dir(env_path: &Path) -> PathBuf {
    match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => env::current_dir().unwrap_or_default(),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_u64(key: &str) -> Result<Option<u64>> {
    non_empty(key)
        .map(|v| v.parse::<u64>().with_context(|| format!("{key} must be a whole number, got {v}")))
        .transpose()
}

fn parse_bool(key: &str) -> bool {
    matches!(
        non_empty(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}
