//! Live subscription to new notes from the monitored authors.
//!
//! One task per relay keeps a `REQ` open, reconnecting after a pause when
//! the relay drops it. Posts are deduplicated across relays before they are
//! handed to the bot.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::event::{verify_event, Event, Filter, KIND_TEXT_NOTE};
use crate::relay::{subscription_id, RelayConnection, RelayError};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 256;
const SEEN_CAPACITY: usize = 10_000;

/// A note as delivered by one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPost {
    pub id: String,
    pub author: String,
    pub kind: u32,
    pub content: String,
    pub created_at: u64,
    pub relay: String,
}

impl IncomingPost {
    pub fn from_event(ev: Event, relay: &str) -> Self {
        Self {
            id: ev.id,
            author: ev.pubkey,
            kind: ev.kind,
            content: ev.content,
            created_at: ev.created_at,
            relay: relay.to_string(),
        }
    }
}

/// Bounded set of recently delivered ids.
#[derive(Debug)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` the first time `id` is offered.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

pub struct EventIntake {
    ctx: AppContext,
    filter: Filter,
    seen: Arc<Mutex<SeenIds>>,
}

impl EventIntake {
    /// Intake for notes by `authors` created at or after `since`.
    pub fn new(ctx: AppContext, authors: Vec<String>, since: u64) -> Self {
        let filter = Filter::default()
            .kinds([KIND_TEXT_NOTE])
            .authors(authors)
            .since(since);
        Self {
            ctx,
            filter,
            seen: Arc::new(Mutex::new(SeenIds::new(SEEN_CAPACITY))),
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Spawn one subscription task per configured relay. The tasks stop on
    /// shutdown or once the receiver is dropped.
    pub fn start(self) -> (mpsc::Receiver<IncomingPost>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let authors = self.filter.authors.as_ref().map_or(0, Vec::len);
        info!(authors, relays = self.ctx.settings.relays.len(), "subscribing to notes");
        let handles = self
            .ctx
            .settings
            .relays
            .iter()
            .map(|relay| {
                let worker = RelayWorker {
                    ctx: self.ctx.clone(),
                    relay: relay.clone(),
                    filter: self.filter.clone(),
                    seen: self.seen.clone(),
                    tx: tx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        (rx, handles)
    }
}

struct RelayWorker {
    ctx: AppContext,
    relay: String,
    filter: Filter,
    seen: Arc<Mutex<SeenIds>>,
    tx: mpsc::Sender<IncomingPost>,
}

impl RelayWorker {
    async fn run(self) {
        loop {
            let res = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                res = self.subscribe() => res,
            };
            if self.tx.is_closed() {
                break;
            }
            match res {
                Ok(()) => info!(relay = %self.relay, "subscription ended, reconnecting"),
                Err(e) => warn!(relay = %self.relay, error = %e, "intake error, reconnecting"),
            }
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
        debug!(relay = %self.relay, "intake worker stopped");
    }

    async fn subscribe(&self) -> Result<(), RelayError> {
        let mut conn = RelayConnection::connect(&self.relay, self.ctx.settings.tor_socks.as_deref()).await?;
        let sub = subscription_id("intake");
        conn.subscribe(&sub, &self.filter).await?;
        debug!(relay = %self.relay, "subscribed");
        loop {
            let ev = conn.next_event(&sub).await?;
            if !self.filter.matches(&ev) {
                continue;
            }
            if self.ctx.settings.verify_sig {
                if let Err(e) = verify_event(&ev) {
                    debug!(relay = %self.relay, event_id = %ev.id, error = %e, "dropping unverifiable note");
                    continue;
                }
            }
            if !self.first_delivery(&ev.id) {
                continue;
            }
            if self.tx.send(IncomingPost::from_event(ev, &self.relay)).await.is_err() {
                conn.close().await;
                return Ok(());
            }
        }
    }

    fn first_delivery(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.insert(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::event::{Tag, UnsignedEvent};
    use crate::keys::Keys;
    use crate::relay::tests::spawn_static_relay;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    fn note(author: &Keys, content: &str, created_at: u64) -> Event {
        let mut unsigned = UnsignedEvent::new("", KIND_TEXT_NOTE, vec![Tag::new(["t", "x"])], content);
        unsigned.created_at = created_at;
        author.sign(unsigned).unwrap()
    }

    fn ctx(relays: Vec<String>) -> AppContext {
        AppContext::new(Settings {
            relays,
            verify_sig: true,
            ..Settings::default()
        })
    }

    #[test]
    fn seen_ids_evicts_oldest() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
    }

    #[tokio::test]
    async fn delivers_each_post_once_across_relays() {
        let author = Keys::generate();
        let stranger = Keys::generate();
        let shared = note(&author, "hello", 100);
        let mut forged = note(&author, "forged", 100);
        forged.content = "tampered".into();
        let a = spawn_static_relay(vec![shared.clone(), note(&stranger, "spam", 100)]).await;
        let b = spawn_static_relay(vec![shared.clone(), forged, note(&author, "second", 101)]).await;
        let ctx = ctx(vec![a, b]);
        let intake = EventIntake::new(ctx.clone(), vec![author.public_key_hex()], 50);
        let (mut rx, handles) = intake.start();

        let mut got = vec![];
        for _ in 0..2 {
            let post = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            got.push(post.content);
        }
        got.sort();
        assert_eq!(got, vec!["hello", "second"]);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        ctx.shutdown.cancel();
        for h in handles {
            timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn old_posts_are_filtered() {
        let author = Keys::generate();
        let relay = spawn_static_relay(vec![note(&author, "old", 10)]).await;
        let ctx = ctx(vec![relay]);
        let (mut rx, _handles) = EventIntake::new(ctx.clone(), vec![author.public_key_hex()], 50).start();
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
        ctx.shutdown.cancel();
    }

    #[tokio::test]
    async fn resubscribes_after_relay_drop() {
        let author = Keys::generate();
        let first = note(&author, "first", 100);
        let second = note(&author, "second", 101);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for ev in [first, second] {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(Message::Text(txt))) = ws.next().await {
                    let val: Value = serde_json::from_str(&txt).unwrap();
                    let msg = json!(["EVENT", val[1], ev]);
                    ws.send(Message::Text(msg.to_string())).await.unwrap();
                }
                ws.close(None).await.unwrap();
            }
        });
        let ctx = ctx(vec![format!("ws://{}", addr)]);
        let (mut rx, _handles) = EventIntake::new(ctx.clone(), vec![author.public_key_hex()], 50).start();
        let a = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(a.content, "first");
        let b = timeout(RECONNECT_DELAY + Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.content, "second");
        assert!(b.relay.starts_with("ws://127.0.0.1"));
        ctx.shutdown.cancel();
    }
}
