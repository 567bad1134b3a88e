//! Per-post pipeline: dedup, budget, settlement and reaction.
//!
//! Settlement and reaction for one post run concurrently and fail
//! independently. Only a successful settlement is written to the ledger,
//! and it is written exactly once.

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::context::{AppContext, ScopeError};
use crate::event::KIND_TEXT_NOTE;
use crate::intake::IncomingPost;
use crate::ledger::{Ledger, LedgerError};
use crate::lnurl::{zap_request_template, NegotiationError, PaymentNegotiator};
use crate::reaction::{ReactionError, ReactionPublisher};
use crate::signer::{Signer, SignerError};
use crate::wallet::{PayInvoiceResult, Wallet, WalletError};

const SETTLE_ATTEMPTS: u32 = 2;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
const SETTLE_BACKOFF: Duration = Duration::from_secs(2);
const REACT_ATTEMPTS: u32 = 2;
const REACT_TIMEOUT: Duration = Duration::from_secs(10);
const REACT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("signer: {0}")]
    Signer(#[from] SignerError),
    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),
    #[error("{0}")]
    Scope(#[from] ScopeError),
}

/// Which spending limit a post would have crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetExceeded {
    Daily { spent: u64, limit: u64 },
    PerAuthor { spent: u64, limit: u64 },
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily { spent, limit } => write!(f, "daily limit ({spent}/{limit} sats)"),
            Self::PerAuthor { spent, limit } => write!(f, "per-author limit ({spent}/{limit} sats)"),
        }
    }
}

/// Terminal state of one post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Paid. `recorded` is false when the ledger write failed afterwards.
    Settled { amount_sats: u64, recorded: bool },
    SkippedDuplicate,
    SkippedBudget(BudgetExceeded),
    /// Not a text note.
    Ignored,
    Failed(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Settled { .. } => "settled",
            Self::SkippedDuplicate => "skipped_duplicate",
            Self::SkippedBudget(_) => "skipped_budget",
            Self::Ignored => "ignored",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOutcome {
    NotAttempted,
    Disabled,
    Published,
    Failed(String),
}

/// What happened to one post; `Display` gives the one-line summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReport {
    pub event_id: String,
    pub author: String,
    pub outcome: Outcome,
    pub reaction: ReactionOutcome,
}

impl fmt::Display for PostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id: String = self.event_id.chars().take(12).collect();
        match &self.outcome {
            Outcome::Settled { amount_sats, recorded } => {
                write!(f, "[{id}] zapped {amount_sats} sats")?;
                if !*recorded {
                    write!(f, " (NOT RECORDED)")?;
                }
            }
            Outcome::SkippedDuplicate => write!(f, "[{id}] already zapped")?,
            Outcome::SkippedBudget(b) => write!(f, "[{id}] skipped: {b}")?,
            Outcome::Ignored => write!(f, "[{id}] ignored")?,
            Outcome::Failed(e) => write!(f, "[{id}] zap failed: {e}")?,
        }
        match &self.reaction {
            ReactionOutcome::Published => write!(f, ", reacted"),
            ReactionOutcome::Failed(e) => write!(f, ", reaction failed: {e}"),
            ReactionOutcome::NotAttempted | ReactionOutcome::Disabled => Ok(()),
        }
    }
}

/// Removes the post id from the in-flight set when dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.id);
    }
}

pub struct Bot {
    ctx: AppContext,
    ledger: Arc<Ledger>,
    signer: Arc<dyn Signer>,
    negotiator: Arc<dyn PaymentNegotiator>,
    wallet: Arc<dyn Wallet>,
    reactions: ReactionPublisher,
    in_flight: Mutex<HashSet<String>>,
    settle_backoff: Duration,
    react_backoff: Duration,
}

impl Bot {
    pub fn new(
        ctx: AppContext,
        ledger: Arc<Ledger>,
        signer: Arc<dyn Signer>,
        negotiator: Arc<dyn PaymentNegotiator>,
        wallet: Arc<dyn Wallet>,
        reactions: ReactionPublisher,
    ) -> Self {
        Self {
            ctx,
            ledger,
            signer,
            negotiator,
            wallet,
            reactions,
            in_flight: Mutex::new(HashSet::new()),
            settle_backoff: SETTLE_BACKOFF,
            react_backoff: REACT_BACKOFF,
        }
    }

    /// Override the pause between attempts.
    pub fn with_backoff(mut self, settle: Duration, react: Duration) -> Self {
        self.settle_backoff = settle;
        self.react_backoff = react;
        self
    }

    /// Drive one post to a terminal outcome.
    pub async fn process_post(&self, post: &IncomingPost) -> PostReport {
        let mut report = PostReport {
            event_id: post.id.clone(),
            author: post.author.clone(),
            outcome: Outcome::Ignored,
            reaction: ReactionOutcome::NotAttempted,
        };
        if post.kind != KIND_TEXT_NOTE {
            debug!(event_id = %post.id, kind = post.kind, "ignoring non-note");
            return report;
        }
        let Some(_claim) = self.claim(&post.id) else {
            report.outcome = Outcome::SkippedDuplicate;
            self.log(&report);
            return report;
        };

        match self.admit(post).await {
            Ok(None) => {}
            Ok(Some(outcome)) => {
                report.outcome = outcome;
                self.log(&report);
                return report;
            }
            Err(e) => {
                report.outcome = Outcome::Failed(format!("ledger: {e}"));
                self.log(&report);
                return report;
            }
        }

        let amount = self.ctx.settings.zap_amount;
        let (settled, reaction) = tokio::join!(self.settle(post, amount), self.react(post));
        report.reaction = reaction;
        report.outcome = match settled {
            Ok(paid) => {
                debug!(event_id = %post.id, preimage = ?paid.preimage, fees_paid_msats = ?paid.fees_paid_msats, "invoice paid");
                let recorded = self.record(post, amount).await;
                Outcome::Settled {
                    amount_sats: amount,
                    recorded,
                }
            }
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.log(&report);
        report
    }

    fn claim(&self, id: &str) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        set.insert(id.to_string()).then(|| Claim {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    /// Run a ledger call on the blocking pool.
    async fn with_ledger<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || f(&ledger)).await?
    }

    /// `Some` when the post must be skipped.
    async fn admit(&self, post: &IncomingPost) -> Result<Option<Outcome>, LedgerError> {
        let settings = &self.ctx.settings;
        let (amount, daily_limit, per_author_limit) =
            (settings.zap_amount, settings.daily_limit, settings.per_author_limit);
        let (id, author) = (post.id.clone(), post.author.clone());
        self.with_ledger(move |ledger| {
            if ledger.is_settled(&id)? {
                return Ok(Some(Outcome::SkippedDuplicate));
            }
            let today = ledger.total_today()?;
            if today.saturating_add(amount) > daily_limit {
                return Ok(Some(Outcome::SkippedBudget(BudgetExceeded::Daily {
                    spent: today,
                    limit: daily_limit,
                })));
            }
            let spent = ledger.total_today_for_author(&author)?;
            if spent.saturating_add(amount) > per_author_limit {
                return Ok(Some(Outcome::SkippedBudget(BudgetExceeded::PerAuthor {
                    spent,
                    limit: per_author_limit,
                })));
            }
            Ok(None)
        })
        .await
    }

    async fn settle(&self, post: &IncomingPost, amount: u64) -> Result<PayInvoiceResult, SettlementError> {
        retry(&self.ctx, "settle", &post.id, SETTLE_ATTEMPTS, self.settle_backoff, move || async move {
            self.ctx
                .scoped(SETTLE_TIMEOUT, self.settle_once(post, amount))
                .await
                .map_err(SettlementError::from)
                .and_then(|res| res)
        })
        .await
    }

    async fn settle_once(&self, post: &IncomingPost, amount: u64) -> Result<PayInvoiceResult, SettlementError> {
        let settings = &self.ctx.settings;
        let endpoint = self.negotiator.resolve_payment_endpoint(&post.author).await?;
        let template = zap_request_template(
            &post.id,
            &post.author,
            amount,
            settings.relays.first().map(String::as_str),
            &settings.zap_comment,
        );
        let zap_request = self.signer.sign_event(template).await?;
        let invoice = self
            .negotiator
            .negotiate_invoice(&endpoint, amount, &zap_request)
            .await?;
        Ok(self.wallet.pay_invoice(&invoice).await?)
    }

    async fn react(&self, post: &IncomingPost) -> ReactionOutcome {
        let settings = &self.ctx.settings;
        if !settings.reaction_enabled {
            return ReactionOutcome::Disabled;
        }
        let res = retry(&self.ctx, "react", &post.id, REACT_ATTEMPTS, self.react_backoff, move || async move {
            self.ctx
                .scoped(
                    REACT_TIMEOUT,
                    self.reactions
                        .react(&post.id, &post.author, &settings.reaction_content, &settings.relays),
                )
                .await
                .map_err(ReactError::Scope)
                .and_then(|res| res.map_err(ReactError::Publish))
        })
        .await;
        match res {
            Ok(()) => ReactionOutcome::Published,
            Err(e) => ReactionOutcome::Failed(e.to_string()),
        }
    }

    async fn record(&self, post: &IncomingPost, amount: u64) -> bool {
        let (id, author, created_at) = (post.id.clone(), post.author.clone(), post.created_at);
        let recorded = self
            .with_ledger(move |ledger| ledger.record_settlement(&id, &author, amount, created_at))
            .await;
        match recorded {
            Ok(()) => true,
            Err(LedgerError::Conflict(id)) => {
                warn!(event_id = %id, "settlement already recorded");
                true
            }
            Err(e) => {
                error!(
                    event_id = %post.id,
                    author = %post.author,
                    amount_sats = amount,
                    reconciliation_required = true,
                    error = %e,
                    "paid but ledger write failed"
                );
                false
            }
        }
    }

    fn log(&self, report: &PostReport) {
        let outcome = report.outcome.label();
        match &report.outcome {
            Outcome::Failed(e) => warn!(event_id = %report.event_id, author = %report.author, outcome, error = %e, reaction = ?report.reaction, "post processed"),
            _ => info!(event_id = %report.event_id, author = %report.author, outcome, reaction = ?report.reaction, "post processed"),
        }
    }

    /// Process posts from `posts` concurrently until shutdown or the channel
    /// closes, then wait for posts already in progress.
    pub async fn run<F>(self: Arc<Self>, mut posts: mpsc::Receiver<IncomingPost>, on_report: F)
    where
        F: Fn(PostReport) + Clone + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                post = posts.recv() => match post {
                    Some(post) => {
                        let bot = self.clone();
                        let on_report = on_report.clone();
                        tasks.spawn(async move {
                            let report = bot.process_post(&post).await;
                            on_report(report);
                        });
                    }
                    None => break,
                },
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!(error = %e, "post task failed");
                    }
                }
            }
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "post task failed");
            }
        }
        info!("bot stopped");
    }
}

#[derive(Debug, Error)]
enum ReactError {
    #[error("{0}")]
    Scope(ScopeError),
    #[error("{0}")]
    Publish(ReactionError),
}

trait Canceled {
    fn is_canceled(&self) -> bool;
}

impl Canceled for SettlementError {
    fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Scope(ScopeError::Canceled) | Self::Wallet(WalletError::Canceled) | Self::Negotiation(NegotiationError::Canceled)
        )
    }
}

impl Canceled for ReactError {
    fn is_canceled(&self) -> bool {
        matches!(self, Self::Scope(ScopeError::Canceled))
    }
}

/// Run `attempt` up to `attempts` times, pausing `backoff` between tries.
/// Shutdown ends the loop early with the last error.
async fn retry<T, E, F, Fut>(
    ctx: &AppContext,
    what: &'static str,
    event_id: &str,
    attempts: u32,
    backoff: Duration,
    mut attempt: F,
) -> Result<T, E>
where
    E: fmt::Display + Canceled,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut n = 1;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if n >= attempts || e.is_canceled() || ctx.shutdown.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(event_id, what, attempt = n, error = %e, "attempt failed, retrying");
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => return Err(e),
                    _ = sleep(backoff) => {}
                }
                n += 1;
            }
        }
    }
}
