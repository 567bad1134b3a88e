//! NIP-51 people lists (kind 30000) owned by the monitoring identity.
//!
//! Members come from public `p` tags and from `p` tags inside the
//! self-encrypted content, which is decrypted through the signing session.

use std::{collections::HashMap, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::event::{Event, Filter, KIND_PEOPLE_LIST};
use crate::relay::fetch_events;
use crate::signer::{Signer, SignerError};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ListError {
    #[error("list {0} not found")]
    NotFound(String),
    #[error("list {0} has no members")]
    Empty(String),
    #[error("signer: {0}")]
    Signer(#[from] SignerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeopleList {
    /// The list's `d` identifier.
    pub id: String,
    pub title: String,
    pub public: Vec<String>,
    pub private: Vec<String>,
    pub created_at: u64,
}

impl PeopleList {
    /// Public then private members, without repeats.
    pub fn members(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for pk in self.public.iter().chain(&self.private) {
            if !out.contains(pk) {
                out.push(pk.clone());
            }
        }
        out
    }

    pub fn has_private(&self) -> bool {
        !self.private.is_empty()
    }
}

/// Build a list from its event and, when available, the decrypted content.
pub fn parse_list(ev: &Event, decrypted: Option<&str>) -> PeopleList {
    let id = ev.tag_values("d").next().unwrap_or_default().to_string();
    let title = ev
        .tag_values("name")
        .chain(ev.tag_values("title"))
        .find(|t| !t.is_empty())
        .unwrap_or(id.as_str())
        .to_string();
    let public = dedup(ev.tag_values("p").map(str::to_string));
    let private = decrypted.map(private_members).unwrap_or_default();
    PeopleList {
        id,
        title,
        public,
        private,
        created_at: ev.created_at,
    }
}

/// `p` entries of a decrypted JSON tag array. Anything else yields nothing.
fn private_members(plain: &str) -> Vec<String> {
    let Ok(Value::Array(tags)) = serde_json::from_str::<Value>(plain) else {
        return vec![];
    };
    dedup(tags.iter().filter_map(|tag| {
        let tag = tag.as_array()?;
        if tag.first()?.as_str()? != "p" {
            return None;
        }
        tag.get(1)?.as_str().map(str::to_string)
    }))
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    for item in items {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Decrypt self-encrypted list content, trying the scheme the payload looks
/// like first.
async fn decrypt_content(signer: &dyn Signer, owner: &str, content: &str) -> Result<String, SignerError> {
    if content.contains("?iv=") {
        return signer.nip04_decrypt(owner, content).await;
    }
    match signer.nip44_decrypt(owner, content).await {
        Ok(plain) => Ok(plain),
        Err(e) if e.is_session_error() => Err(e),
        Err(e) => {
            debug!(error = %e, "nip44 decrypt failed, trying nip04");
            signer.nip04_decrypt(owner, content).await
        }
    }
}

/// Every people list published by `owner`, newest version per `d` identifier,
/// sorted by title.
pub async fn fetch_lists(ctx: &AppContext, owner: &str, signer: &dyn Signer) -> Result<Vec<PeopleList>, ListError> {
    let filter = Filter::default().kinds([KIND_PEOPLE_LIST]).authors([owner]);
    let events = fetch_events(&ctx.settings.relays, &filter, LIST_TIMEOUT, ctx.settings.tor_socks.as_deref()).await;

    let mut latest: HashMap<String, Event> = HashMap::new();
    for ev in events.into_iter().filter(|ev| ev.pubkey == owner) {
        let d = ev.tag_values("d").next().unwrap_or_default().to_string();
        match latest.get(&d) {
            Some(existing) if existing.created_at >= ev.created_at => {}
            _ => {
                latest.insert(d, ev);
            }
        }
    }

    let mut lists = Vec::with_capacity(latest.len());
    for ev in latest.into_values() {
        let plain = if ev.content.trim().is_empty() {
            None
        } else {
            match decrypt_content(signer, owner, &ev.content).await {
                Ok(plain) => Some(plain),
                Err(e) if e.is_session_error() => return Err(e.into()),
                Err(e) => {
                    warn!(event_id = %ev.id, error = %e, "could not decrypt private list members");
                    None
                }
            }
        };
        lists.push(parse_list(&ev, plain.as_deref()));
    }
    lists.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
    Ok(lists)
}

/// Members of the list identified by `id`.
pub async fn resolve_selected(
    ctx: &AppContext,
    owner: &str,
    signer: &dyn Signer,
    id: &str,
) -> Result<Vec<String>, ListError> {
    let list = fetch_lists(ctx, owner, signer)
        .await?
        .into_iter()
        .find(|l| l.id == id)
        .ok_or_else(|| ListError::NotFound(id.to_string()))?;
    let members = list.members();
    if members.is_empty() {
        return Err(ListError::Empty(id.to_string()));
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::crypto::{nip04_encrypt, nip44_encrypt};
    use crate::event::{Tag, UnsignedEvent};
    use crate::keys::{parse_public_key, Keys};
    use crate::relay::tests::spawn_static_relay;
    use crate::signer::LocalSigner;

    fn list_event(owner: &Keys, d: &str, title: &str, members: &[&str], content: String, created_at: u64) -> Event {
        let mut tags = vec![Tag::new(["d", d]), Tag::new(["title", title])];
        tags.extend(members.iter().map(|m| Tag::new(["p", *m])));
        let mut unsigned = UnsignedEvent::new("", KIND_PEOPLE_LIST, tags, content);
        unsigned.created_at = created_at;
        owner.sign(unsigned).unwrap()
    }

    fn private_payload(members: &[&str]) -> String {
        let tags: Vec<Vec<&str>> = members.iter().map(|m| vec!["p", *m]).collect();
        serde_json::to_string(&tags).unwrap()
    }

    #[test]
    fn parses_public_and_private_members() {
        let owner = Keys::generate();
        let ev = list_event(&owner, "friends", "Friends", &["a", "b", "a"], String::new(), 1);
        let plain = r#"[["p","c"],["t","x"],["p","b"],["p"]]"#;
        let list = parse_list(&ev, Some(plain));
        assert_eq!(list.id, "friends");
        assert_eq!(list.title, "Friends");
        assert_eq!(list.public, vec!["a", "b"]);
        assert_eq!(list.private, vec!["c", "b"]);
        assert_eq!(list.members(), vec!["a", "b", "c"]);
        assert!(list.has_private());
    }

    #[test]
    fn title_falls_back_to_identifier() {
        let owner = Keys::generate();
        let mut unsigned = UnsignedEvent::new("", KIND_PEOPLE_LIST, vec![Tag::new(["d", "devs"])], "");
        unsigned.created_at = 1;
        let ev = owner.sign(unsigned).unwrap();
        assert_eq!(parse_list(&ev, Some("not json")).title, "devs");
        assert!(parse_list(&ev, Some("not json")).private.is_empty());
    }

    #[tokio::test]
    async fn fetches_newest_lists_and_decrypts_private_members() {
        let owner = Keys::generate();
        let own_pk = parse_public_key(&owner.public_key_hex()).unwrap();
        let nip44 = nip44_encrypt(&owner.secret_key(), &own_pk, &private_payload(&["p44"])).unwrap();
        let nip04 = nip04_encrypt(&owner.secret_key(), &own_pk, &private_payload(&["p04"])).unwrap();
        let events = vec![
            list_event(&owner, "friends", "Friends (old)", &["stale"], String::new(), 1),
            list_event(&owner, "friends", "Friends", &["a"], nip44, 2),
            list_event(&owner, "devs", "Devs", &[], nip04, 3),
            list_event(&Keys::generate(), "spoof", "Spoof", &["x"], String::new(), 4),
        ];
        // newer "friends" claiming the owner's key, signed by another
        let mut forged = list_event(&Keys::generate(), "friends", "Hijacked", &["mallory"], String::new(), 5);
        forged.pubkey = owner.public_key_hex();
        let events = [events, vec![forged]].concat();
        let relay = spawn_static_relay(events).await;
        let ctx = AppContext::new(Settings {
            relays: vec![relay],
            ..Settings::default()
        });
        let signer = LocalSigner::new(owner.clone());
        let lists = fetch_lists(&ctx, &owner.public_key_hex(), &signer).await.unwrap();
        let titles: Vec<_> = lists.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["Devs", "Friends"]);
        assert_eq!(lists[0].private, vec!["p04"]);
        assert_eq!(lists[1].members(), vec!["a", "p44"]);

        let members = resolve_selected(&ctx, &owner.public_key_hex(), &signer, "friends")
            .await
            .unwrap();
        assert_eq!(members, vec!["a", "p44"]);
        let err = resolve_selected(&ctx, &owner.public_key_hex(), &signer, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ListError::NotFound(_)));
    }
}
