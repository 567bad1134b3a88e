//! Minimal NIP-01 relay client used for subscriptions, one-shot queries and
//! publishing signed events.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::event::{verify_event, Event, Filter};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("subscription closed by relay: {0}")]
    SubscriptionClosed(String),
    #[error("timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for RelayError {
    fn from(e: tungstenite::Error) -> Self {
        use std::io::ErrorKind;
        use tungstenite::error::ProtocolError;
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                RelayError::ConnectionClosed
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                RelayError::ConnectionClosed
            }
            tungstenite::Error::Io(io)
                if matches!(
                    io.kind(),
                    ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::UnexpectedEof
                ) =>
            {
                RelayError::ConnectionClosed
            }
            other => RelayError::WebSocket(other.to_string()),
        }
    }
}

/// Messages a relay sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Event },
    Eose(String),
    Ok { event_id: String, accepted: bool, message: String },
    Closed { subscription: String, message: String },
    Notice(String),
}

/// Parse a relay frame; unknown or malformed frames yield `None`.
pub fn parse_relay_message(txt: &str) -> Option<RelayMessage> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    let str_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            let event = serde_json::from_value::<Event>(arr[2].clone()).ok()?;
            Some(RelayMessage::Event {
                subscription: str_at(1)?,
                event,
            })
        }
        Some("EOSE") => Some(RelayMessage::Eose(str_at(1)?)),
        Some("OK") if arr.len() >= 3 => Some(RelayMessage::Ok {
            event_id: str_at(1)?,
            accepted: arr[2].as_bool()?,
            message: str_at(3).unwrap_or_default(),
        }),
        Some("CLOSED") => Some(RelayMessage::Closed {
            subscription: str_at(1)?,
            message: str_at(2).unwrap_or_default(),
        }),
        Some("NOTICE") => Some(RelayMessage::Notice(str_at(1).unwrap_or_default())),
        _ => None,
    }
}

/// Random subscription id with a readable prefix.
pub fn subscription_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::random::<u32>())
}

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// A single WebSocket connection to a relay.
///
/// Messages read while waiting for an `OK` are kept in a backlog so a
/// subscription opened before publishing does not lose events.
pub struct RelayConnection {
    url: String,
    ws: RelayStream,
    backlog: VecDeque<RelayMessage>,
}

impl RelayConnection {
    /// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
    pub async fn connect(relay: &str, tor_socks: Option<&str>) -> Result<Self, RelayError> {
        let url = Url::parse(relay).map_err(|e| RelayError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RelayError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::InvalidUrl("missing host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RelayError::InvalidUrl("missing port".into()))?;
        let req = relay.into_client_request()?;
        let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
            Box::new(
                Socks5Stream::connect(proxy, (host, port))
                    .await
                    .map_err(|e| RelayError::Proxy(e.to_string()))?,
            )
        } else {
            Box::new(TcpStream::connect((host, port)).await?)
        };
        let (ws, _) = client_async_tls(req, stream).await?;
        debug!(relay, "connected");
        Ok(Self {
            url: relay.to_string(),
            ws,
            backlog: VecDeque::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_json(&mut self, msg: Value) -> Result<(), RelayError> {
        self.ws.send(Message::Text(msg.to_string())).await?;
        Ok(())
    }

    /// Issue a `REQ` for `filter`.
    pub async fn subscribe(&mut self, sub_id: &str, filter: &Filter) -> Result<(), RelayError> {
        let msg = serde_json::json!(["REQ", sub_id, filter]);
        self.send_json(msg).await
    }

    /// Send `CLOSE` for a subscription.
    pub async fn close_subscription(&mut self, sub_id: &str) -> Result<(), RelayError> {
        self.send_json(serde_json::json!(["CLOSE", sub_id])).await
    }

    /// Publish `ev` and wait for the relay's `OK`.
    pub async fn publish(&mut self, ev: &Event) -> Result<(), RelayError> {
        self.send_json(serde_json::json!(["EVENT", ev])).await?;
        loop {
            match self.read_frame().await? {
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                } if event_id == ev.id => {
                    return if accepted {
                        Ok(())
                    } else {
                        Err(RelayError::Rejected(message))
                    };
                }
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Next relay message, draining anything buffered during `publish` first.
    pub async fn next_message(&mut self) -> Result<RelayMessage, RelayError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(msg);
        }
        self.read_frame().await
    }

    /// Next event delivered on `sub_id`. `EOSE` is skipped; a relay-side
    /// `CLOSED` for the subscription ends it with an error.
    pub async fn next_event(&mut self, sub_id: &str) -> Result<Event, RelayError> {
        loop {
            match self.next_message().await? {
                RelayMessage::Event {
                    subscription,
                    event,
                } if subscription == sub_id => return Ok(event),
                RelayMessage::Closed {
                    subscription,
                    message,
                } if subscription == sub_id => return Err(RelayError::SubscriptionClosed(message)),
                RelayMessage::Notice(notice) => debug!(relay = %self.url, notice, "relay notice"),
                _ => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<RelayMessage, RelayError> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(txt) => {
                    if let Some(parsed) = parse_relay_message(&txt) {
                        return Ok(parsed);
                    }
                }
                Message::Close(_) => return Err(RelayError::ConnectionClosed),
                _ => {}
            }
        }
        Err(RelayError::ConnectionClosed)
    }

    /// Close the socket, ignoring errors from an already dead peer.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Publishes a signed event to a single relay.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, relay: &str, ev: &Event) -> Result<(), RelayError>;
}

/// Opens a short-lived connection per publish.
#[derive(Debug, Clone, Default)]
pub struct RelayPublisher {
    tor_socks: Option<String>,
}

impl RelayPublisher {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self { tor_socks }
    }
}

#[async_trait]
impl EventPublisher for RelayPublisher {
    async fn publish(&self, relay: &str, ev: &Event) -> Result<(), RelayError> {
        let mut conn = RelayConnection::connect(relay, self.tor_socks.as_deref()).await?;
        let res = conn.publish(ev).await;
        conn.close().await;
        res
    }
}

/// Query every relay concurrently and return the union of matching events,
/// deduplicated by id and sorted newest first. Events with a bad id or
/// signature are dropped. Relays that fail or do not finish before `wait`
/// elapses contribute what they delivered so far.
pub async fn fetch_events(relays: &[String], filter: &Filter, wait: Duration, tor_socks: Option<&str>) -> Vec<Event> {
    let deadline = Instant::now() + wait;
    let results = join_all(
        relays
            .iter()
            .map(|url| fetch_from(url, filter, deadline, tor_socks)),
    )
    .await;
    let mut seen = std::collections::HashSet::new();
    let mut events: Vec<Event> = results
        .into_iter()
        .zip(relays)
        .filter_map(|(res, url)| match res {
            Ok(events) => Some(events),
            Err(e) => {
                debug!(relay = %url, error = %e, "fetch failed");
                None
            }
        })
        .flatten()
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect();
    events.sort_by_key(|e| std::cmp::Reverse(e.created_at));
    events
}

async fn fetch_from(url: &str, filter: &Filter, deadline: Instant, tor_socks: Option<&str>) -> Result<Vec<Event>, RelayError> {
    let mut conn = timeout_at(deadline, RelayConnection::connect(url, tor_socks))
        .await
        .map_err(|_| RelayError::Timeout)??;
    let sub = subscription_id("fetch");
    conn.subscribe(&sub, filter).await?;
    let mut events = vec![];
    loop {
        match timeout_at(deadline, conn.next_message()).await {
            Err(_) => break,
            Ok(Err(e)) if events.is_empty() => return Err(e),
            Ok(Err(_)) => break,
            Ok(Ok(RelayMessage::Event {
                subscription,
                event,
            })) if subscription == sub && filter.matches(&event) => match verify_event(&event) {
                Ok(()) => events.push(event),
                Err(e) => debug!(relay = url, event_id = %event.id, error = %e, "dropping unverified event"),
            },
            Ok(Ok(RelayMessage::Eose(s))) if s == sub => break,
            Ok(Ok(RelayMessage::Closed { subscription, .. })) if subscription == sub => break,
            Ok(Ok(_)) => {}
        }
    }
    let _ = conn.close_subscription(&sub).await;
    conn.close().await;
    Ok(events)
}
