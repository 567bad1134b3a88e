//! Wallet-connect (NIP-47) client: encrypted request/response over a relay.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::context::{AppContext, ScopeError};
use crate::crypto::{self, CryptoError};
use crate::event::{verify_event, Event, Filter, Tag, UnsignedEvent, KIND_WALLET_REQUEST, KIND_WALLET_RESPONSE};
use crate::keys::{self, KeyError, Keys};
use crate::relay::{subscription_id, RelayConnection, RelayError};

/// How long to wait for the wallet's answer once the request is published.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid wallet connect url: {0}")]
    InvalidUrl(String),
    #[error("timed out waiting for wallet response")]
    ResponseTimeout,
    #[error("wallet error {code}: {message}")]
    Wallet { code: String, message: String },
    #[error("wallet request canceled")]
    Canceled,
    #[error("invalid wallet response: {0}")]
    InvalidResponse(String),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Parsed `nostr+walletconnect://<wallet-pubkey>?relay=...&secret=...` URL.
#[derive(Clone, PartialEq, Eq)]
pub struct NwcUrl {
    pub wallet_pubkey: String,
    pub relay: String,
    pub secret: String,
    pub lud16: Option<String>,
}

impl NwcUrl {
    pub fn parse(input: &str) -> Result<Self, WalletError> {
        let url = Url::parse(input.trim()).map_err(|e| WalletError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "nostr+walletconnect" {
            return Err(WalletError::InvalidUrl(format!(
                "expected nostr+walletconnect, got {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| WalletError::InvalidUrl("missing wallet pubkey".into()))?;
        let wallet_pubkey = keys::normalize_pubkey(host).map_err(|e| WalletError::InvalidUrl(e.to_string()))?;
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };
        let relay = param("relay").ok_or_else(|| WalletError::InvalidUrl("missing relay parameter".into()))?;
        let secret = param("secret").ok_or_else(|| WalletError::InvalidUrl("missing secret parameter".into()))?;
        Keys::from_hex(&secret).map_err(|e| WalletError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            wallet_pubkey,
            relay,
            secret,
            lud16: param("lud16"),
        })
    }
}

impl std::fmt::Debug for NwcUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NwcUrl")
            .field("wallet_pubkey", &self.wallet_pubkey)
            .field("relay", &self.relay)
            .field("lud16", &self.lud16)
            .finish_non_exhaustive()
    }
}

/// Result of `pay_invoice`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PayInvoiceResult {
    #[serde(default)]
    pub preimage: Option<String>,
    #[serde(default, rename = "fees_paid")]
    pub fees_paid_msats: Option<u64>,
}

/// Result of `get_balance`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GetBalanceResult {
    #[serde(rename = "balance")]
    pub balance_msats: u64,
}

/// Remote wallet able to settle invoices.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn pay_invoice(&self, invoice: &str) -> Result<PayInvoiceResult, WalletError>;
    async fn get_balance(&self) -> Result<GetBalanceResult, WalletError>;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    result_type: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// NIP-47 client holding one lazily (re)established connection to the
/// wallet relay. Requests are serialized on that connection.
pub struct NwcClient {
    ctx: AppContext,
    url: NwcUrl,
    keys: Keys,
    wallet: secp256k1::XOnlyPublicKey,
    conn: Mutex<Option<RelayConnection>>,
    response_timeout: Duration,
}

impl NwcClient {
    pub fn new(ctx: AppContext, url: NwcUrl) -> Result<Self, WalletError> {
        let keys = Keys::from_hex(&url.secret)?;
        let wallet = keys::parse_public_key(&url.wallet_pubkey)?;
        Ok(Self {
            ctx,
            url,
            keys,
            wallet,
            conn: Mutex::new(None),
            response_timeout: RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    async fn open(&self) -> Result<RelayConnection, WalletError> {
        let tor = self.ctx.settings.tor_socks.as_deref();
        let conn = self
            .ctx
            .scoped(PUBLISH_TIMEOUT, RelayConnection::connect(&self.url.relay, tor))
            .await
            .map_err(scope_error)??;
        info!(relay = %self.url.relay, "connected to wallet relay");
        Ok(conn)
    }

    fn request_event(&self, method: &str, params: Value) -> Result<Event, WalletError> {
        let body = json!({ "method": method, "params": params }).to_string();
        let content = crypto::nip04_encrypt(&self.keys.secret_key(), &self.wallet, &body)?;
        Ok(self.keys.sign(UnsignedEvent::new(
            "",
            KIND_WALLET_REQUEST,
            vec![Tag::new(["p", self.url.wallet_pubkey.as_str()])],
            content,
        ))?)
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        let request = self.request_event(method, params)?;
        let sub = subscription_id("nwc");
        let filter = Filter::default()
            .kinds([KIND_WALLET_RESPONSE])
            .event_refs([request.id.clone()])
            .limit(1);
        let mut guard = self.conn.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if guard.is_none() {
                *guard = Some(self.open().await?);
            }
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            let published = self
                .ctx
                .scoped(PUBLISH_TIMEOUT, async {
                    conn.subscribe(&sub, &filter).await?;
                    conn.publish(&request).await
                })
                .await
                .map_err(scope_error)?;
            match published {
                Ok(()) => break,
                Err(RelayError::ConnectionClosed) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(method, attempt, "wallet relay connection closed, reconnecting");
                    *guard = None;
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => return Err(WalletError::Canceled),
                        _ = tokio::time::sleep(PUBLISH_RETRY_PAUSE) => {}
                    }
                }
                Err(e) => {
                    *guard = None;
                    return Err(e.into());
                }
            }
        }
        debug!(method, request_id = %request.id, "wallet request published");

        let Some(conn) = guard.as_mut() else {
            return Err(WalletError::Relay(RelayError::ConnectionClosed));
        };
        let waited = self
            .ctx
            .scoped(self.response_timeout, self.await_response(conn, &sub))
            .await;
        let reply = match waited {
            Ok(Ok(reply)) => {
                let _ = conn.close_subscription(&sub).await;
                reply
            }
            Ok(Err(e)) => {
                *guard = None;
                return Err(e);
            }
            Err(ScopeError::DeadlineExceeded) => {
                let _ = conn.close_subscription(&sub).await;
                warn!(method, "timed out waiting for wallet response");
                return Err(WalletError::ResponseTimeout);
            }
            Err(ScopeError::Canceled) => return Err(WalletError::Canceled),
        };
        drop(guard);
        interpret(method, reply)
    }

    /// First response on `sub` that is signed by the wallet and decrypts to a
    /// well-formed body. Anything else is skipped.
    async fn await_response(&self, conn: &mut RelayConnection, sub: &str) -> Result<WireResponse, WalletError> {
        loop {
            let ev = conn.next_event(sub).await?;
            if ev.pubkey != self.url.wallet_pubkey || ev.kind != KIND_WALLET_RESPONSE {
                continue;
            }
            if let Err(e) = verify_event(&ev) {
                warn!(event_id = %ev.id, error = %e, "ignoring wallet response with bad signature");
                continue;
            }
            match self.decode(&ev) {
                Ok(resp) => return Ok(resp),
                Err(e) => warn!(event_id = %ev.id, error = %e, "ignoring undecodable wallet response"),
            }
        }
    }

    fn decode(&self, reply: &Event) -> Result<WireResponse, WalletError> {
        let secret = self.keys.secret_key();
        let plaintext = if reply.content.contains("?iv=") {
            crypto::nip04_decrypt(&secret, &self.wallet, &reply.content)?
        } else {
            crypto::nip44_decrypt(&secret, &self.wallet, &reply.content)?
        };
        serde_json::from_str(&plaintext).map_err(|e| WalletError::InvalidResponse(e.to_string()))
    }

    /// Drop the relay connection.
    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            info!("closing wallet relay connection");
            conn.close().await;
        }
    }
}

fn interpret(method: &str, resp: WireResponse) -> Result<Value, WalletError> {
    if let Some(err) = resp.error {
        warn!(method, code = %err.code, message = %err.message, "wallet returned error");
        return Err(WalletError::Wallet {
            code: err.code,
            message: err.message,
        });
    }
    if let Some(kind) = resp.result_type.as_deref().filter(|k| *k != method) {
        return Err(WalletError::InvalidResponse(format!("unexpected result_type {kind}")));
    }
    resp.result
        .ok_or_else(|| WalletError::InvalidResponse("missing result".into()))
}

fn scope_error(e: ScopeError) -> WalletError {
    match e {
        ScopeError::Canceled => WalletError::Canceled,
        ScopeError::DeadlineExceeded => WalletError::Relay(RelayError::Timeout),
    }
}

#[async_trait]
impl Wallet for NwcClient {
    async fn pay_invoice(&self, invoice: &str) -> Result<PayInvoiceResult, WalletError> {
        let result = self
            .send_request("pay_invoice", json!({ "invoice": invoice }))
            .await?;
        let paid: PayInvoiceResult =
            serde_json::from_value(result).map_err(|e| WalletError::InvalidResponse(e.to_string()))?;
        info!(fees_paid_msats = ?paid.fees_paid_msats, "invoice paid");
        Ok(paid)
    }

    async fn get_balance(&self) -> Result<GetBalanceResult, WalletError> {
        let result = self.send_request("get_balance", json!({})).await?;
        serde_json::from_value(result).map_err(|e| WalletError::InvalidResponse(e.to_string()))
    }
}
