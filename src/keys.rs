//! secp256k1 keys: signing, bech32 `npub` handling and the persisted session secret.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use bech32::{Bech32, Hrp};
use secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1};
use thiserror::Error;
use tracing::{info, warn};

use crate::event::{Event, UnsignedEvent};

const NPUB_HRP: &str = "npub";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: {0}")]
    InvalidSecret(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("bech32 error: {0}")]
    Bech32(String),
    #[error("expected npub, got {0}")]
    WrongPrefix(String),
    #[error("event hashing failed: {0}")]
    Hash(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local keypair able to sign events directly.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(SECP256K1, &mut rand::thread_rng()),
        }
    }

    /// Parse a hex-encoded 32 byte secret.
    pub fn from_hex(secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(secret.trim()).map_err(|e| KeyError::InvalidSecret(e.to_string()))?;
        let sk = SecretKey::from_slice(&bytes).map_err(|e| KeyError::InvalidSecret(e.to_string()))?;
        Ok(Self {
            keypair: Keypair::from_secret_key(SECP256K1, &sk),
        })
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// x-only public key, hex encoded.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    /// Hash and Schnorr-sign `unsigned` with this key.
    ///
    /// The template's `pubkey` is overwritten with this key's public key.
    pub fn sign(&self, mut unsigned: UnsignedEvent) -> Result<Event, KeyError> {
        unsigned.pubkey = self.public_key_hex();
        let hash = unsigned.hash().map_err(|e| KeyError::Hash(e.to_string()))?;
        let msg = Message::from_digest_slice(&hash).map_err(|e| KeyError::Hash(e.to_string()))?;
        let sig = SECP256K1.sign_schnorr(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: unsigned.pubkey,
            kind: unsigned.kind,
            created_at: unsigned.created_at,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse an x-only public key given as 64 hex chars.
pub fn parse_public_key(hex_key: &str) -> Result<XOnlyPublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Decode an `npub1...` string into its hex public key.
pub fn npub_to_hex(npub: &str) -> Result<String, KeyError> {
    let (hrp, data) = bech32::decode(npub.trim()).map_err(|e| KeyError::Bech32(e.to_string()))?;
    if hrp.as_str() != NPUB_HRP {
        return Err(KeyError::WrongPrefix(hrp.to_string()));
    }
    if data.len() != 32 {
        return Err(KeyError::InvalidPublicKey(format!("{} bytes", data.len())));
    }
    Ok(hex::encode(data))
}

/// Encode a hex public key as `npub1...`.
pub fn hex_to_npub(hex_key: &str) -> Result<String, KeyError> {
    let key = parse_public_key(hex_key)?;
    let hrp = Hrp::parse(NPUB_HRP).map_err(|e| KeyError::Bech32(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &key.serialize()).map_err(|e| KeyError::Bech32(e.to_string()))
}

/// Accept either an `npub` or a 64 char hex key and return hex.
pub fn normalize_pubkey(input: &str) -> Result<String, KeyError> {
    let input = input.trim();
    if input.starts_with(NPUB_HRP) {
        return npub_to_hex(input);
    }
    parse_public_key(input)?;
    Ok(input.to_lowercase())
}

/// Load the signing-session secret from `path`, regenerating it when the
/// file is missing or does not hold a valid key.
pub fn load_or_generate(path: &Path) -> Result<Keys, KeyError> {
    if let Ok(data) = fs::read_to_string(path) {
        match Keys::from_hex(&data) {
            Ok(keys) => return Ok(keys),
            Err(e) => warn!(path = %path.display(), error = %e, "session key malformed, regenerating"),
        }
    }
    let keys = Keys::generate();
    persist_secret(path, &keys)?;
    info!(path = %path.display(), pubkey = %keys.public_key_hex(), "generated new session key");
    Ok(keys)
}

/// Write the secret atomically next to its final location.
fn persist_secret(path: &Path, keys: &Keys) -> Result<(), KeyError> {
    let parent_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
    tmp.write_all(keys.secret_hex().as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| KeyError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{verify_event, Tag, KIND_TEXT_NOTE};
    use tempfile::TempDir;

    // secret key 1 maps to the generator point
    const G_X: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn key_one() -> Keys {
        Keys::from_hex(&format!("{}01", "00".repeat(31))).unwrap()
    }

    #[test]
    fn public_key_of_one_is_generator() {
        assert_eq!(key_one().public_key_hex(), G_X);
    }

    #[test]
    fn signed_events_verify() {
        let keys = Keys::generate();
        let ev = keys
            .sign(UnsignedEvent::new(
                "",
                KIND_TEXT_NOTE,
                vec![Tag::new(["t", "x"])],
                "hi",
            ))
            .unwrap();
        assert_eq!(ev.pubkey, keys.public_key_hex());
        verify_event(&ev).unwrap();
    }

    #[test]
    fn npub_round_trip() {
        let npub = hex_to_npub(G_X).unwrap();
        assert!(npub.starts_with("npub1"));
        assert_eq!(npub_to_hex(&npub).unwrap(), G_X);
        assert_eq!(normalize_pubkey(&npub).unwrap(), G_X);
        assert_eq!(normalize_pubkey(&G_X.to_uppercase()).unwrap(), G_X);
    }

    #[test]
    fn npub_rejects_other_prefix() {
        let hrp = Hrp::parse("nsec").unwrap();
        let nsec = bech32::encode::<Bech32>(hrp, &[1u8; 32]).unwrap();
        assert!(matches!(npub_to_hex(&nsec), Err(KeyError::WrongPrefix(_))));
    }

    #[test]
    fn session_key_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.key");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[test]
    fn malformed_session_key_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.key");
        fs::write(&path, "not-a-key").unwrap();
        let keys = load_or_generate(&path).unwrap();
        let stored = fs::read_to_string(&path).unwrap();
        assert_eq!(stored, keys.secret_hex());
    }
}
