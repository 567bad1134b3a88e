//! Payment negotiation: profile lookup, lightning address resolution and
//! LNURL-pay invoice requests carrying a signed zap request.

use std::time::Duration;

use async_trait::async_trait;
use bech32::primitives::decode::CheckedHrpstring;
use bech32::Bech32;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::context::AppContext;
use crate::event::{Event, Filter, Tag, UnsignedEvent, KIND_METADATA, KIND_ZAP_REQUEST};
use crate::relay::fetch_events;

/// Bound on the profile lookup across all relays.
pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no payment address found for {0}")]
    NoPaymentAddress(String),
    #[error("invalid payment address: {0}")]
    InvalidAddress(String),
    #[error("invalid payment endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("amount {requested_msats} msats out of bounds ({min_msats}-{max_msats})")]
    AmountOutOfBounds {
        requested_msats: u64,
        min_msats: u64,
        max_msats: u64,
    },
    #[error("payment endpoint rejected request: {0}")]
    RemoteRejected(String),
    #[error("payment endpoint returned no invoice")]
    EmptyInvoice,
    #[error("http error: {0}")]
    Http(String),
    #[error("negotiation canceled")]
    Canceled,
}

/// Turns a recipient into a payable invoice.
#[async_trait]
pub trait PaymentNegotiator: Send + Sync {
    /// LNURL-pay endpoint advertised in the author's profile.
    async fn resolve_payment_endpoint(&self, author: &str) -> Result<String, NegotiationError>;

    /// Exchange a signed zap request for an invoice of `amount_sats`.
    async fn negotiate_invoice(
        &self,
        endpoint: &str,
        amount_sats: u64,
        zap_request: &Event,
    ) -> Result<String, NegotiationError>;
}

/// `user@domain` to `https://domain/.well-known/lnurlp/user`. Anything without
/// exactly one `@` separating two non-empty parts yields `None`.
pub fn address_to_endpoint(address: &str) -> Option<String> {
    let parts: Vec<&str> = address.trim().split('@').collect();
    match parts.as_slice() {
        [user, domain] if !user.is_empty() && !domain.is_empty() => {
            Some(format!("https://{domain}/.well-known/lnurlp/{user}"))
        }
        _ => None,
    }
}

/// Decode a bech32 `lnurl1...` string into the URL it wraps.
pub fn decode_lnurl(lnurl: &str) -> Result<String, NegotiationError> {
    let lower = lnurl.trim().to_lowercase();
    let lower = lower.strip_prefix("lightning:").unwrap_or(&lower);
    let checked = CheckedHrpstring::new::<Bech32>(lower)
        .map_err(|e| NegotiationError::InvalidAddress(e.to_string()))?;
    if checked.hrp().as_str() != "lnurl" {
        return Err(NegotiationError::InvalidAddress(format!("unexpected prefix {}", checked.hrp())));
    }
    let bytes: Vec<u8> = checked.byte_iter().collect();
    String::from_utf8(bytes).map_err(|e| NegotiationError::InvalidAddress(e.to_string()))
}

/// Unsigned zap request for `post_id` by `author`.
pub fn zap_request_template(
    post_id: &str,
    author: &str,
    amount_sats: u64,
    relay: Option<&str>,
    comment: &str,
) -> UnsignedEvent {
    let mut tags = vec![
        Tag::new(["e", post_id]),
        Tag::new(["p", author]),
        Tag::new(["amount".to_string(), amount_sats.saturating_mul(1000).to_string()]),
    ];
    if let Some(relay) = relay {
        tags.push(Tag::new(["relays", relay]));
    }
    UnsignedEvent::new("", KIND_ZAP_REQUEST, tags, comment)
}

#[derive(Debug, Default, Deserialize)]
struct ProfileAddress {
    #[serde(default)]
    lud16: Option<String>,
    #[serde(default)]
    lud06: Option<String>,
}

impl ProfileAddress {
    fn endpoint(&self) -> Option<String> {
        let lud16 = self.lud16.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(endpoint) = lud16.and_then(address_to_endpoint) {
            return Some(endpoint);
        }
        let lud06 = self.lud06.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        match decode_lnurl(lud06) {
            Ok(url) => Some(url),
            Err(e) => {
                debug!(error = %e, "unusable lud06");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayMetadata {
    #[serde(default)]
    callback: String,
    #[serde(default)]
    min_sendable: u64,
    #[serde(default)]
    max_sendable: u64,
    #[serde(default)]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    #[serde(default)]
    pr: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// LNURL-pay negotiator using the configured relays for profile lookup.
pub struct LnurlNegotiator {
    ctx: AppContext,
    http: reqwest::Client,
}

impl LnurlNegotiator {
    pub fn new(ctx: AppContext) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("zapwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { ctx, http }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<(reqwest::StatusCode, T), NegotiationError> {
        let fut = async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| NegotiationError::Http(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .map_err(|e| NegotiationError::Http(e.to_string()))?;
            match serde_json::from_slice::<T>(&body) {
                Ok(parsed) => Ok((status, parsed)),
                Err(_) if !status.is_success() => Err(NegotiationError::Http(format!("status {status}"))),
                Err(e) => Err(NegotiationError::InvalidEndpoint(e.to_string())),
            }
        };
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Err(NegotiationError::Canceled),
            res = fut => res,
        }
    }

    /// Request an invoice for an exact millisatoshi amount.
    pub async fn request_invoice(
        &self,
        endpoint: &str,
        amount_msats: u64,
        zap_request: &Event,
    ) -> Result<String, NegotiationError> {
        debug!(endpoint, "fetching LNURL metadata");
        let (status, meta): (_, PayMetadata) = self.get_json(endpoint).await?;
        if !status.is_success() {
            return Err(NegotiationError::Http(format!("{endpoint} returned status {status}")));
        }
        if meta.tag != "payRequest" {
            return Err(NegotiationError::InvalidEndpoint(format!("unexpected tag {:?}", meta.tag)));
        }
        if amount_msats < meta.min_sendable || amount_msats > meta.max_sendable {
            return Err(NegotiationError::AmountOutOfBounds {
                requested_msats: amount_msats,
                min_msats: meta.min_sendable,
                max_msats: meta.max_sendable,
            });
        }
        let mut callback =
            Url::parse(&meta.callback).map_err(|e| NegotiationError::InvalidEndpoint(format!("callback: {e}")))?;
        let nostr = zap_request
            .to_json()
            .map_err(|e| NegotiationError::InvalidEndpoint(e.to_string()))?;
        callback
            .query_pairs_mut()
            .append_pair("amount", &amount_msats.to_string())
            .append_pair("nostr", &nostr);

        let (status, invoice): (_, InvoiceResponse) = self.get_json(callback.as_str()).await?;
        if invoice
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("ERROR"))
        {
            let reason = invoice.reason.unwrap_or_default();
            warn!(endpoint, reason = %reason, "payment endpoint returned error");
            return Err(NegotiationError::RemoteRejected(reason));
        }
        if !status.is_success() {
            return Err(NegotiationError::Http(format!("callback returned status {status}")));
        }
        invoice
            .pr
            .filter(|pr| !pr.trim().is_empty())
            .ok_or(NegotiationError::EmptyInvoice)
    }
}

#[async_trait]
impl PaymentNegotiator for LnurlNegotiator {
    async fn resolve_payment_endpoint(&self, author: &str) -> Result<String, NegotiationError> {
        let settings = &self.ctx.settings;
        let filter = Filter::default()
            .kinds([KIND_METADATA])
            .authors([author])
            .limit(1);
        let lookup = fetch_events(&settings.relays, &filter, PROFILE_TIMEOUT, settings.tor_socks.as_deref());
        let profiles = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => return Err(NegotiationError::Canceled),
            events = lookup => events,
        };
        profiles
            .iter()
            .filter(|ev| ev.pubkey == author)
            .filter_map(|ev| serde_json::from_str::<ProfileAddress>(&ev.content).ok())
            .find_map(|profile| profile.endpoint())
            .ok_or_else(|| NegotiationError::NoPaymentAddress(author.to_string()))
    }

    async fn negotiate_invoice(
        &self,
        endpoint: &str,
        amount_sats: u64,
        zap_request: &Event,
    ) -> Result<String, NegotiationError> {
        self.request_invoice(endpoint, amount_sats.saturating_mul(1000), zap_request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::keys::Keys;
    use crate::relay::tests::spawn_static_relay;
    use bech32::Hrp;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_with_relays(relays: Vec<String>) -> AppContext {
        AppContext::new(Settings {
            relays,
            ..Settings::default()
        })
    }

    fn signed_zap() -> Event {
        Keys::generate()
            .sign(zap_request_template("evt-1", "auth-1", 3, Some("wss://r"), "gm"))
            .unwrap()
    }

    async fn pay_server(min: u64, max: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/lnurlp/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "callback": format!("{}/callback", server.uri()),
                "minSendable": min,
                "maxSendable": max,
                "tag": "payRequest",
                "allowsNostr": true
            })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn converts_address_to_endpoint() {
        assert_eq!(
            address_to_endpoint("alice@example.com").as_deref(),
            Some("https://example.com/.well-known/lnurlp/alice")
        );
        assert_eq!(address_to_endpoint("alice.example.com"), None);
        assert_eq!(address_to_endpoint("a@b@example.com"), None);
        assert_eq!(address_to_endpoint("@example.com"), None);
    }

    #[test]
    fn decodes_lnurl() {
        let target = "https://example.com/.well-known/lnurlp/alice";
        let encoded = bech32::encode::<Bech32>(Hrp::parse("lnurl").unwrap(), target.as_bytes()).unwrap();
        assert_eq!(decode_lnurl(&encoded.to_uppercase()).unwrap(), target);
        assert!(decode_lnurl("lnurl1notvalid").is_err());
    }

    #[test]
    fn zap_request_carries_amount_in_msats() {
        let ev = zap_request_template("evt-1", "auth-1", 3, Some("wss://r"), "gm");
        assert_eq!(ev.kind, KIND_ZAP_REQUEST);
        assert_eq!(ev.content, "gm");
        let amount = ev.tags.iter().find(|t| t.name() == Some("amount")).unwrap();
        assert_eq!(amount.value(), Some("3000"));
        assert!(ev.tags.contains(&Tag::new(["relays", "wss://r"])));
    }

    #[test]
    fn huge_amounts_saturate() {
        let ev = zap_request_template("evt-1", "auth-1", u64::MAX, None, "");
        let amount = ev.tags.iter().find(|t| t.name() == Some("amount")).unwrap();
        assert_eq!(amount.value(), Some(u64::MAX.to_string().as_str()));
    }

    #[tokio::test]
    async fn negotiates_within_bounds() {
        let server = pay_server(1000, 100_000).await;
        Mock::given(method("GET"))
            .and(path("/callback"))
            .and(query_param("amount", "3000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pr": "lnbc30n1", "routes": []})))
            .expect(1)
            .mount(&server)
            .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let endpoint = format!("{}/.well-known/lnurlp/alice", server.uri());
        let invoice = neg.negotiate_invoice(&endpoint, 3, &signed_zap()).await.unwrap();
        assert_eq!(invoice, "lnbc30n1");
    }

    #[tokio::test]
    async fn callback_receives_signed_zap_request() {
        let server = pay_server(1000, 100_000).await;
        Mock::given(method("GET"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pr": "lnbc30n1"})))
            .mount(&server)
            .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let zap = signed_zap();
        let endpoint = format!("{}/.well-known/lnurlp/alice", server.uri());
        neg.negotiate_invoice(&endpoint, 3, &zap).await.unwrap();
        let requests = server.received_requests().await.unwrap();
        let callback = requests.iter().find(|r| r.url.path() == "/callback").unwrap();
        let nostr = callback
            .url
            .query_pairs()
            .find(|(k, _)| k == "nostr")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let sent: Event = serde_json::from_str(&nostr).unwrap();
        assert_eq!(sent, zap);
    }

    #[tokio::test]
    async fn rejects_amount_below_minimum() {
        let server = pay_server(1000, 100_000).await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let endpoint = format!("{}/.well-known/lnurlp/alice", server.uri());
        let err = neg.request_invoice(&endpoint, 500, &signed_zap()).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::AmountOutOfBounds {
                requested_msats: 500,
                min_msats: 1000,
                ..
            }
        ));
        let msg = err.to_string();
        assert!(msg.contains("500") && msg.contains("1000"));
    }

    #[tokio::test]
    async fn rejects_non_pay_request_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "callback": "https://x/cb", "minSendable": 1, "maxSendable": 10, "tag": "withdrawRequest"
            })))
            .mount(&server)
            .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let err = neg.negotiate_invoice(&server.uri(), 3, &signed_zap()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn surfaces_remote_error_and_empty_invoice() {
        let server = pay_server(1000, 100_000).await;
        Mock::given(method("GET"))
            .and(path("/callback"))
            .and(query_param("amount", "3000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ERROR", "reason": "zaps disabled"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/callback"))
            .and(query_param("amount", "4000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pr": ""})))
            .mount(&server)
            .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let endpoint = format!("{}/.well-known/lnurlp/alice", server.uri());
        let err = neg.negotiate_invoice(&endpoint, 3, &signed_zap()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::RemoteRejected(ref r) if r == "zaps disabled"));
        let err = neg.negotiate_invoice(&endpoint, 4, &signed_zap()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::EmptyInvoice));
    }

    #[tokio::test]
    async fn http_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![]));
        let err = neg.negotiate_invoice(&server.uri(), 3, &signed_zap()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Http(_)));
    }

    fn profile(author: &Keys, content: serde_json::Value, created_at: u64) -> Event {
        let mut unsigned = UnsignedEvent::new("", KIND_METADATA, vec![], content.to_string());
        unsigned.created_at = created_at;
        author.sign(unsigned).unwrap()
    }

    #[tokio::test]
    async fn resolves_newest_profile_address() {
        let author = Keys::generate();
        let relay = spawn_static_relay(vec![
            profile(&author, json!({"lud16": "old@example.com"}), 10),
            profile(&author, json!({"name": "a", "lud16": "alice@example.com"}), 20),
        ])
        .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![relay]));
        let endpoint = neg.resolve_payment_endpoint(&author.public_key_hex()).await.unwrap();
        assert_eq!(endpoint, "https://example.com/.well-known/lnurlp/alice");
    }

    #[tokio::test]
    async fn ignores_profiles_signed_by_another_key() {
        let author = Keys::generate();
        let mut forged = profile(&Keys::generate(), json!({"lud16": "mallory@evil.example"}), 20);
        forged.pubkey = author.public_key_hex();
        let relay = spawn_static_relay(vec![
            profile(&author, json!({"lud16": "alice@example.com"}), 10),
            forged,
        ])
        .await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![relay]));
        let endpoint = neg.resolve_payment_endpoint(&author.public_key_hex()).await.unwrap();
        assert_eq!(endpoint, "https://example.com/.well-known/lnurlp/alice");
    }

    #[tokio::test]
    async fn falls_back_to_lud06() {
        let author = Keys::generate();
        let target = "https://pay.example.com/lnurlp/bob";
        let lnurl = bech32::encode::<Bech32>(Hrp::parse("lnurl").unwrap(), target.as_bytes()).unwrap();
        let relay = spawn_static_relay(vec![profile(&author, json!({"lud06": lnurl}), 10)]).await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![relay]));
        let endpoint = neg.resolve_payment_endpoint(&author.public_key_hex()).await.unwrap();
        assert_eq!(endpoint, target);
    }

    #[tokio::test]
    async fn missing_address_fails() {
        let author = Keys::generate();
        let relay = spawn_static_relay(vec![profile(&author, json!({"name": "no wallet"}), 10)]).await;
        let neg = LnurlNegotiator::new(ctx_with_relays(vec![relay]));
        let err = neg
            .resolve_payment_endpoint(&author.public_key_hex())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::NoPaymentAddress(_)));
    }
}
