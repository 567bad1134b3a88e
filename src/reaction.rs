//! Kind-7 reactions acknowledging a zapped post.

use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CustomEmoji;
use crate::context::AppContext;
use crate::event::{Tag, UnsignedEvent, KIND_REACTION, KIND_TEXT_NOTE};
use crate::relay::EventPublisher;
use crate::signer::{Signer, SignerError};

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("signing reaction failed: {0}")]
    Signer(#[from] SignerError),
    #[error("no relay accepted the reaction")]
    NoRelayAccepted,
}

/// Unsigned reaction to `event_id` by `author`.
pub fn reaction_template(event_id: &str, author: &str, content: &str, emoji: Option<&CustomEmoji>) -> UnsignedEvent {
    let mut tags = vec![
        Tag::new(["e", event_id]),
        Tag::new(["p", author]),
        Tag::new(["k".to_string(), KIND_TEXT_NOTE.to_string()]),
    ];
    if let Some(emoji) = emoji {
        tags.push(Tag::new(["emoji", emoji.name.as_str(), emoji.url.as_str()]));
    }
    UnsignedEvent::new("", KIND_REACTION, tags, content)
}

pub struct ReactionPublisher {
    ctx: AppContext,
    signer: Arc<dyn Signer>,
    publisher: Arc<dyn EventPublisher>,
}

impl ReactionPublisher {
    pub fn new(ctx: AppContext, signer: Arc<dyn Signer>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            ctx,
            signer,
            publisher,
        }
    }

    /// Sign a reaction and publish it to every relay independently.
    ///
    /// Succeeds when at least one relay accepts it. Does nothing when
    /// reactions are disabled.
    pub async fn react(&self, event_id: &str, author: &str, content: &str, relays: &[String]) -> Result<(), ReactionError> {
        let settings = &self.ctx.settings;
        if !settings.reaction_enabled {
            return Ok(());
        }
        let unsigned = reaction_template(event_id, author, content, settings.reaction_emoji.as_ref());
        let signed = self.signer.sign_event(unsigned).await?;
        let results = join_all(relays.iter().map(|relay| self.publisher.publish(relay, &signed))).await;
        let mut accepted = 0;
        for (relay, res) in relays.iter().zip(results) {
            match res {
                Ok(()) => accepted += 1,
                Err(e) => debug!(relay = %relay, error = %e, "reaction not accepted"),
            }
        }
        if accepted == 0 {
            return Err(ReactionError::NoRelayAccepted);
        }
        info!(event_id, accepted, "reaction published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::event::{verify_event, Event};
    use crate::keys::Keys;
    use crate::relay::RelayError;
    use crate::signer::LocalSigner;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts publishes only for relays in `accepting`.
    #[derive(Default)]
    struct FakePublisher {
        accepting: Vec<String>,
        seen: Mutex<Vec<(String, Event)>>,
    }

    #[async_trait]
    impl EventPublisher for FakePublisher {
        async fn publish(&self, relay: &str, ev: &Event) -> Result<(), RelayError> {
            self.seen.lock().unwrap().push((relay.to_string(), ev.clone()));
            if self.accepting.iter().any(|r| r == relay) {
                Ok(())
            } else {
                Err(RelayError::Rejected("blocked".into()))
            }
        }
    }

    fn publisher_with(settings: Settings, fake: Arc<FakePublisher>) -> ReactionPublisher {
        ReactionPublisher::new(
            AppContext::new(settings),
            Arc::new(LocalSigner::new(Keys::generate())),
            fake,
        )
    }

    fn enabled() -> Settings {
        Settings {
            reaction_enabled: true,
            reaction_content: ":catJAM:".into(),
            reaction_emoji: Some(CustomEmoji {
                name: "catJAM".into(),
                url: "https://example.com/catjam.gif".into(),
            }),
            ..Settings::default()
        }
    }

    fn relays() -> Vec<String> {
        vec!["wss://a".into(), "wss://b".into()]
    }

    #[tokio::test]
    async fn disabled_is_a_no_op() {
        let fake = Arc::new(FakePublisher::default());
        let reactions = publisher_with(Settings::default(), fake.clone());
        reactions.react("evt-1", "auth-1", "+", &relays()).await.unwrap();
        assert!(fake.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_accepting_relay_is_enough() {
        let fake = Arc::new(FakePublisher {
            accepting: vec!["wss://b".into()],
            ..Default::default()
        });
        let reactions = publisher_with(enabled(), fake.clone());
        reactions
            .react("evt-1", "auth-1", ":catJAM:", &relays())
            .await
            .unwrap();
        let seen = fake.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let ev = &seen[0].1;
        verify_event(ev).unwrap();
        assert_eq!(ev.kind, KIND_REACTION);
        assert_eq!(ev.content, ":catJAM:");
        assert!(ev.tags.contains(&Tag::new(["e", "evt-1"])));
        assert!(ev.tags.contains(&Tag::new(["p", "auth-1"])));
        assert!(ev.tags.contains(&Tag::new(["k", "1"])));
        assert!(ev
            .tags
            .contains(&Tag::new(["emoji", "catJAM", "https://example.com/catjam.gif"])));
    }

    #[tokio::test]
    async fn fails_when_no_relay_accepts() {
        let fake = Arc::new(FakePublisher::default());
        let reactions = publisher_with(enabled(), fake);
        let err = reactions
            .react("evt-1", "auth-1", "+", &relays())
            .await
            .unwrap_err();
        assert!(matches!(err, ReactionError::NoRelayAccepted));
    }

    #[test]
    fn template_without_emoji_has_three_tags() {
        let ev = reaction_template("evt-1", "auth-1", "+", None);
        assert_eq!(ev.tags.len(), 3);
    }
}
