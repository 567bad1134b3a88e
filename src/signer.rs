//! Remote signing session (NIP-46) and the reconnecting handle the bot uses.
//!
//! [`BunkerSession`] speaks the bunker protocol over one relay connection.
//! [`ReconnectingSigner`] owns the current session as an immutable snapshot
//! behind a read-mostly lock: callers clone the handle, issue their call, and
//! on a session-class failure trigger one reconnect and one retry. A reconnect
//! only takes the write lock to swap the handle, so in-flight calls against
//! the old session simply fail and are retried against the new one.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::context::{AppContext, ScopeError};
use crate::crypto;
use crate::event::{unix_now, verify_event, Event, Filter, Tag, UnsignedEvent, KIND_NOSTR_CONNECT};
use crate::keys::{self, Keys};
use crate::relay::{subscription_id, RelayConnection, RelayError};

/// Bound on a single bunker request, including user approval.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on establishing a session, including the `connect` approval.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signing request canceled")]
    Canceled,
    #[error("signing request deadline exceeded")]
    DeadlineExceeded,
    #[error("remote signer rejected request: {0}")]
    Rejected(String),
    #[error("invalid signer response: {0}")]
    InvalidResponse(String),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("invalid bunker url: {0}")]
    InvalidUrl(String),
    #[error("local key error: {0}")]
    Key(String),
}

impl SignerError {
    /// Session-class failures warrant a reconnect; everything else is a
    /// protocol answer that a new session would repeat.
    pub fn is_session_error(&self) -> bool {
        matches!(self, SignerError::Canceled | SignerError::DeadlineExceeded)
    }
}

impl From<ScopeError> for SignerError {
    fn from(e: ScopeError) -> Self {
        match e {
            ScopeError::Canceled => SignerError::Canceled,
            ScopeError::DeadlineExceeded => SignerError::DeadlineExceeded,
        }
    }
}

impl From<RelayError> for SignerError {
    fn from(e: RelayError) -> Self {
        match e {
            // a dropped transport ends the session the same way a cancel does
            RelayError::ConnectionClosed => SignerError::Canceled,
            other => SignerError::Relay(other.to_string()),
        }
    }
}

impl From<keys::KeyError> for SignerError {
    fn from(e: keys::KeyError) -> Self {
        SignerError::Key(e.to_string())
    }
}

impl From<crypto::CryptoError> for SignerError {
    fn from(e: crypto::CryptoError) -> Self {
        SignerError::InvalidResponse(e.to_string())
    }
}

/// Something able to sign and decrypt on behalf of the monitoring identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the identity this signer signs for.
    async fn public_key(&self) -> Result<String, SignerError>;
    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;
    async fn nip44_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError>;
    async fn nip04_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError>;
}

/// Signer backed by a key held in process.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.keys.public_key_hex())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        Ok(self.keys.sign(unsigned)?)
    }

    async fn nip44_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        let pk = keys::parse_public_key(sender)?;
        Ok(crypto::nip44_decrypt(&self.keys.secret_key(), &pk, ciphertext)?)
    }

    async fn nip04_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        let pk = keys::parse_public_key(sender)?;
        Ok(crypto::nip04_decrypt(&self.keys.secret_key(), &pk, ciphertext)?)
    }
}

/// Parsed `bunker://<remote-signer-pubkey>?relay=...&secret=...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUrl {
    pub remote_pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUrl {
    pub fn parse(input: &str) -> Result<Self, SignerError> {
        let url = Url::parse(input.trim()).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "bunker" {
            return Err(SignerError::InvalidUrl(format!("unexpected scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| SignerError::InvalidUrl("missing remote signer pubkey".into()))?;
        let remote_pubkey = keys::normalize_pubkey(host).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        let mut relays = vec![];
        let mut secret = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "relay" if !v.is_empty() => relays.push(v.into_owned()),
                "secret" if !v.is_empty() => secret = Some(v.into_owned()),
                _ => {}
            }
        }
        if relays.is_empty() {
            return Err(SignerError::InvalidUrl("no relay given".into()));
        }
        Ok(Self {
            remote_pubkey,
            relays,
            secret,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BunkerResponse {
    id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One live NIP-46 session over a single relay connection.
///
/// Requests are serialized on the connection; the response for each request
/// is matched by its random id.
pub struct BunkerSession {
    ctx: AppContext,
    client: Keys,
    remote: secp256k1::XOnlyPublicKey,
    remote_hex: String,
    user_pubkey: String,
    sub_id: String,
    conn: Mutex<RelayConnection>,
}

impl BunkerSession {
    /// Connect to the first reachable bunker relay, run the `connect`
    /// handshake and learn the user's public key.
    pub async fn connect(ctx: AppContext, url: &BunkerUrl, client: Keys) -> Result<Self, SignerError> {
        let remote = keys::parse_public_key(&url.remote_pubkey)?;
        let tor = ctx.settings.tor_socks.clone();
        let mut last_err = SignerError::Relay("no relay reachable".into());
        let mut conn = None;
        for relay in &url.relays {
            match RelayConnection::connect(relay, tor.as_deref()).await {
                Ok(c) => {
                    conn = Some(c);
                    break;
                }
                Err(e) => {
                    warn!(relay, error = %e, "bunker relay unreachable");
                    last_err = e.into();
                }
            }
        }
        let mut conn = conn.ok_or(last_err)?;
        let sub_id = subscription_id("nip46");
        let filter = Filter::default()
            .kinds([KIND_NOSTR_CONNECT])
            .pubkey_refs([client.public_key_hex()])
            .since(unix_now().saturating_sub(10));
        conn.subscribe(&sub_id, &filter).await?;
        let mut session = Self {
            ctx,
            client,
            remote,
            remote_hex: url.remote_pubkey.clone(),
            user_pubkey: String::new(),
            sub_id,
            conn: Mutex::new(conn),
        };

        let mut params = vec![url.remote_pubkey.clone()];
        if let Some(secret) = &url.secret {
            params.push(secret.clone());
        }
        match session.request("connect", params, CONNECT_TIMEOUT).await {
            Ok(_) => info!(remote = %session.remote_hex, "connected to remote signer"),
            Err(SignerError::Rejected(msg)) if msg.contains("already connected") => {
                info!(remote = %session.remote_hex, "remote signer reports existing connection, continuing")
            }
            Err(e) => return Err(e),
        }
        let pubkey = session
            .request("get_public_key", Vec::<String>::new(), REQUEST_TIMEOUT)
            .await?;
        session.user_pubkey =
            keys::normalize_pubkey(&pubkey).map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        Ok(session)
    }

    async fn request(&self, method: &str, params: Vec<String>, limit: Duration) -> Result<String, SignerError> {
        let id = hex::encode(rand::random::<[u8; 8]>());
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();
        let content = crypto::nip44_encrypt(&self.client.secret_key(), &self.remote, &payload)?;
        let ev = self.client.sign(UnsignedEvent::new(
            "",
            KIND_NOSTR_CONNECT,
            vec![Tag::new(["p", self.remote_hex.as_str()])],
            content,
        ))?;
        debug!(method, request_id = %id, "bunker request");
        let mut conn = self.conn.lock().await;
        self.ctx
            .scoped(limit, self.exchange(&mut conn, &ev, &id))
            .await?
    }

    /// Publish `request` and wait for the matching response on our subscription.
    async fn exchange(&self, conn: &mut RelayConnection, request: &Event, id: &str) -> Result<String, SignerError> {
        conn.publish(request).await?;
        loop {
            let reply = conn.next_event(&self.sub_id).await?;
            if reply.pubkey != self.remote_hex {
                continue;
            }
            let Some(resp) = self.decode(&reply) else {
                continue;
            };
            if resp.id != id {
                continue;
            }
            let result = match resp.result {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            if result == "auth_url" {
                warn!(
                    url = resp.error.as_deref().unwrap_or_default(),
                    "remote signer requires approval, open the URL to continue"
                );
                continue;
            }
            if let Some(err) = resp.error.filter(|e| !e.is_empty()) {
                return Err(SignerError::Rejected(err));
            }
            return Ok(result);
        }
    }

    fn decode(&self, reply: &Event) -> Option<BunkerResponse> {
        let secret = self.client.secret_key();
        let plaintext = if reply.content.contains("?iv=") {
            crypto::nip04_decrypt(&secret, &self.remote, &reply.content)
        } else {
            crypto::nip44_decrypt(&secret, &self.remote, &reply.content)
        };
        match plaintext {
            Ok(p) => serde_json::from_str(&p).ok(),
            Err(e) => {
                debug!(error = %e, "undecryptable bunker message");
                None
            }
        }
    }
}

#[async_trait]
impl Signer for BunkerSession {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.user_pubkey.clone())
    }

    async fn sign_event(&self, mut unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        unsigned.pubkey = self.user_pubkey.clone();
        let template = serde_json::to_string(&unsigned).map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        let signed = self.request("sign_event", vec![template], REQUEST_TIMEOUT).await?;
        let ev: Event = serde_json::from_str(&signed).map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        verify_event(&ev).map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        if ev.pubkey != self.user_pubkey {
            return Err(SignerError::InvalidResponse("signed by unexpected key".into()));
        }
        Ok(ev)
    }

    async fn nip44_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        self.request("nip44_decrypt", vec![sender.into(), ciphertext.into()], REQUEST_TIMEOUT)
            .await
    }

    async fn nip04_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        self.request("nip04_decrypt", vec![sender.into(), ciphertext.into()], REQUEST_TIMEOUT)
            .await
    }
}

/// Creates fresh signing sessions for [`ReconnectingSigner`].
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Signer>, SignerError>;
}

/// Opens [`BunkerSession`]s with the persisted client key, so the remote
/// signer recognizes repeat sessions without asking for approval again.
pub struct BunkerFactory {
    ctx: AppContext,
    url: BunkerUrl,
    client: Keys,
}

impl BunkerFactory {
    pub fn new(ctx: AppContext, url: BunkerUrl, client: Keys) -> Self {
        Self { ctx, url, client }
    }
}

#[async_trait]
impl SessionFactory for BunkerFactory {
    async fn connect(&self) -> Result<Arc<dyn Signer>, SignerError> {
        let session = BunkerSession::connect(self.ctx.clone(), &self.url, self.client.clone()).await?;
        Ok(Arc::new(session))
    }
}

/// Lifecycle of the reconnecting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Approved,
    Active,
    Degraded,
    Reconnecting,
    Failed,
}

struct Handle {
    generation: u64,
    signer: Arc<dyn Signer>,
}

/// Signing session that replaces itself wholesale on session failure and on
/// a fixed keepalive interval.
pub struct ReconnectingSigner {
    factory: Arc<dyn SessionFactory>,
    current: RwLock<Handle>,
    gate: Mutex<()>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl ReconnectingSigner {
    /// Establish the first session. Failure here is fatal to the caller.
    pub async fn connect(factory: Arc<dyn SessionFactory>, shutdown: CancellationToken) -> Result<Self, SignerError> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let signer = factory.connect().await?;
        state.send_replace(SessionState::Approved);
        let this = Self {
            factory,
            current: RwLock::new(Handle {
                generation: 0,
                signer,
            }),
            gate: Mutex::new(()),
            state,
            shutdown,
        };
        this.state.send_replace(SessionState::Active);
        Ok(this)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn snapshot(&self) -> (u64, Arc<dyn Signer>) {
        let handle = self.current.read().await;
        (handle.generation, handle.signer.clone())
    }

    /// Replace the session unless another caller already replaced the one
    /// that failed (`failed_generation`).
    async fn reconnect(&self, failed_generation: u64) -> Result<(), SignerError> {
        let _gate = self.gate.lock().await;
        if self.current.read().await.generation != failed_generation {
            debug!("session already replaced");
            return Ok(());
        }
        self.state.send_replace(SessionState::Reconnecting);
        info!("reconnecting signing session");
        let fresh = tokio::select! {
            _ = self.shutdown.cancelled() => Err(SignerError::Canceled),
            res = self.factory.connect() => res,
        };
        match fresh {
            Ok(signer) => {
                let mut handle = self.current.write().await;
                handle.generation += 1;
                handle.signer = signer;
                self.state.send_replace(SessionState::Active);
                info!(generation = handle.generation, "signing session reconnected");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(SessionState::Failed);
                error!(error = %e, "signing session reconnect failed");
                Err(e)
            }
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, SignerError>
    where
        F: Fn(Arc<dyn Signer>) -> Fut,
        Fut: Future<Output = Result<T, SignerError>>,
    {
        let (generation, signer) = self.snapshot().await;
        match f(signer).await {
            Err(e) if e.is_session_error() && !self.shutdown.is_cancelled() => {
                warn!(op, error = %e, "signing session error, reconnecting once");
                self.state.send_replace(SessionState::Degraded);
                if self.reconnect(generation).await.is_err() {
                    return Err(e);
                }
                let (_, signer) = self.snapshot().await;
                f(signer).await
            }
            other => other,
        }
    }

    /// Periodically replace the session until shutdown.
    pub fn spawn_keepalive(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        info!("proactive signing session refresh");
                        let (generation, _) = this.snapshot().await;
                        if let Err(e) = this.reconnect(generation).await {
                            warn!(error = %e, "keepalive reconnect failed, keeping previous session");
                        }
                    }
                }
            }
            debug!("signing session keepalive stopped");
        })
    }
}

#[async_trait]
impl Signer for ReconnectingSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        self.call("get_public_key", |s| async move { s.public_key().await })
            .await
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        self.call("sign_event", |s| {
            let unsigned = unsigned.clone();
            async move { s.sign_event(unsigned).await }
        })
        .await
    }

    async fn nip44_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        self.call("nip44_decrypt", |s| async move { s.nip44_decrypt(sender, ciphertext).await })
            .await
    }

    async fn nip04_decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, SignerError> {
        self.call("nip04_decrypt", |s| async move { s.nip04_decrypt(sender, ciphertext).await })
            .await
    }
}
