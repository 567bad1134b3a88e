//! Watches a curated set of Nostr identities and zaps each new note once,
//! signing through a remote signer and paying through a wallet-connect
//! wallet, with an optional reaction alongside every zap.

pub mod bot;
pub mod config;
pub mod context;
pub mod crypto;
pub mod event;
pub mod intake;
pub mod keys;
pub mod ledger;
pub mod lists;
pub mod lnurl;
pub mod reaction;
pub mod relay;
pub mod signer;
pub mod wallet;
