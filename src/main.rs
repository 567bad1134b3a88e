//! Command line interface for the zap bot. Supports initialization, running
//! the bot, inspecting the ledger and configuration, choosing a people list
//! to monitor and checking the wallet balance.

use std::{fs, path::Path, sync::Arc};

use anyhow::{bail, Context};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zapwatch::{
    bot::Bot,
    config::{env_dir, Settings},
    context::AppContext,
    event::unix_now,
    intake::EventIntake,
    keys::{load_or_generate, normalize_pubkey},
    ledger::Ledger,
    lists::{fetch_lists, resolve_selected},
    lnurl::LnurlNegotiator,
    reaction::ReactionPublisher,
    relay::RelayPublisher,
    signer::{BunkerFactory, BunkerUrl, ReconnectingSigner, Signer},
    wallet::{NwcClient, NwcUrl, Wallet},
};

const RECENT_LIMIT: usize = 5;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "zapwatch",
    author,
    version,
    about = "Zaps new notes from curated Nostr identities"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` (if missing) and create the ledger.
    Init,
    /// Run the bot until interrupted.
    Start,
    /// Print ledger totals and the most recent zaps.
    Stats,
    /// List the monitoring identity's people lists.
    Lists {
        /// Persist this list identifier as `SELECTED_LIST`.
        #[arg(long, value_name = "ID")]
        select: Option<String>,
    },
    /// Print the loaded configuration with secrets masked.
    Show,
    /// Query the wallet balance.
    Balance,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let settings = Settings::from_env(&cli.env)?;
    init_tracing();
    match cli.command {
        Commands::Init => {
            Ledger::open(&settings.db_path)?;
            println!("env file: {}", cli.env);
            println!("ledger: {}", settings.db_path.display());
        }
        Commands::Start => start(settings).await?,
        Commands::Stats => print_stats(&settings)?,
        Commands::Lists { select } => show_lists(&cli.env, settings, select).await?,
        Commands::Show => println!("{settings}"),
        Commands::Balance => print_balance(settings).await?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    // already installed when `run` is called more than once in-process
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn start(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let nwc = NwcUrl::parse(&settings.nwc_url)?;
    let ctx = AppContext::new(settings);
    let ledger = Arc::new(Ledger::open(&ctx.settings.db_path)?);

    let signer = connect_signer(&ctx).await?;
    let keepalive = signer.spawn_keepalive(ctx.settings.bunker_keepalive);
    let monitored = resolve_monitored(&ctx, signer.as_ref()).await?;

    let wallet = Arc::new(NwcClient::new(ctx.clone(), nwc)?);
    match wallet.get_balance().await {
        Ok(b) => info!(balance_sats = b.balance_msats / 1000, "wallet connected"),
        Err(e) => warn!(error = %e, "could not fetch wallet balance"),
    }

    let signer: Arc<dyn Signer> = signer;
    let publisher = Arc::new(RelayPublisher::new(ctx.settings.tor_socks.clone()));
    let reactions = ReactionPublisher::new(ctx.clone(), signer.clone(), publisher);
    let negotiator = Arc::new(LnurlNegotiator::new(ctx.clone()));
    let bot = Arc::new(Bot::new(
        ctx.clone(),
        ledger,
        signer,
        negotiator,
        wallet.clone(),
        reactions,
    ));

    let (posts, intake) = EventIntake::new(ctx.clone(), monitored, unix_now()).start();
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    bot.run(posts, |report| println!("{report}")).await;
    ctx.shutdown.cancel();
    for task in intake {
        let _ = task.await;
    }
    let _ = keepalive.await;
    wallet.close().await;
    Ok(())
}

async fn connect_signer(ctx: &AppContext) -> anyhow::Result<Arc<ReconnectingSigner>> {
    let url = BunkerUrl::parse(&ctx.settings.bunker_url)?;
    let client = load_or_generate(&ctx.settings.session_key_path)?;
    info!(remote = %url.remote_pubkey, relays = url.relays.len(), "connecting to remote signer");
    let factory = Arc::new(BunkerFactory::new(ctx.clone(), url, client));
    let signer = ReconnectingSigner::connect(factory, ctx.shutdown.clone()).await?;
    Ok(Arc::new(signer))
}

/// `MONITORED` plus the members of `SELECTED_LIST`, without repeats.
async fn resolve_monitored(ctx: &AppContext, signer: &dyn Signer) -> anyhow::Result<Vec<String>> {
    let mut monitored = ctx.settings.monitored.clone();
    if let Some(id) = &ctx.settings.selected_list {
        let members = resolve_selected(ctx, &ctx.settings.author, signer, id)
            .await
            .with_context(|| format!("resolving SELECTED_LIST {id}"))?;
        for member in members {
            match normalize_pubkey(&member) {
                Ok(hex) if !monitored.contains(&hex) => monitored.push(hex),
                Ok(_) => {}
                Err(e) => warn!(member = %member, error = %e, "skipping malformed list member"),
            }
        }
    }
    if monitored.is_empty() {
        bail!("no identities to monitor");
    }
    info!(count = monitored.len(), "monitoring identities");
    Ok(monitored)
}

fn print_stats(settings: &Settings) -> anyhow::Result<()> {
    let ledger = Ledger::open(&settings.db_path)?;
    let stats = ledger.stats()?;
    println!("zaps:            {}", stats.total_zaps);
    println!("total sats:      {}", stats.total_sats);
    println!("today:           {} sats", stats.today_sats);
    println!(
        "remaining today: {} sats",
        settings.daily_limit.saturating_sub(stats.today_sats)
    );
    println!("authors:         {}", stats.distinct_authors);
    let recent = ledger.recent(RECENT_LIMIT)?;
    if !recent.is_empty() {
        println!("recent:");
    }
    for entry in recent {
        let when = DateTime::from_timestamp(entry.settled_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_default();
        println!("  {when}  {} sats  {}  {}", entry.amount_sats, entry.event_id, entry.author);
    }
    Ok(())
}

async fn show_lists(env_path: &str, settings: Settings, select: Option<String>) -> anyhow::Result<()> {
    if settings.author.is_empty() {
        bail!("AUTHOR_NPUB is required to look up lists");
    }
    let ctx = AppContext::new(settings);
    let signer = connect_signer(&ctx).await?;
    let lists = fetch_lists(&ctx, &ctx.settings.author, signer.as_ref()).await?;
    if lists.is_empty() {
        println!("no people lists found");
    }
    for list in &lists {
        let marker = if list.has_private() { " (private)" } else { "" };
        println!(
            "{}{}  {} members  id={}",
            list.title,
            marker,
            list.members().len(),
            list.id
        );
    }
    if let Some(id) = select {
        if !lists.iter().any(|l| l.id == id) {
            bail!("no list with id {id}");
        }
        write_key_to_env(env_path, "SELECTED_LIST", &id)?;
        println!("selected {id}");
    }
    ctx.shutdown.cancel();
    Ok(())
}

async fn print_balance(settings: Settings) -> anyhow::Result<()> {
    let url = NwcUrl::parse(&settings.nwc_url)?;
    let wallet = NwcClient::new(AppContext::new(settings), url)?;
    let res = wallet.get_balance().await;
    wallet.close().await;
    let balance = res?;
    println!("{} sats", balance.balance_msats / 1000);
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base = env_dir(env_path);
    let mut content = String::new();
    content.push_str("# zapwatch configuration\n");
    content.push_str("RELAYS=wss://relay.damus.io,wss://nos.lol,wss://relay.primal.net\n");
    content.push_str("AUTHOR_NPUB=\n");
    content.push_str("BUNKER_URL=\n");
    content.push_str("NWC_URL=\n");
    content.push_str("MONITORED=\n");
    content.push_str("SELECTED_LIST=\n");
    content.push_str("ZAP_AMOUNT=21\n");
    content.push_str("ZAP_COMMENT=\n");
    content.push_str("DAILY_LIMIT=1000\n");
    content.push_str("PER_AUTHOR_LIMIT=\n");
    content.push_str("REACTION_ENABLED=0\n");
    content.push_str("REACTION_CONTENT=+\n");
    content.push_str("REACTION_EMOJI_NAME=\n");
    content.push_str("REACTION_EMOJI_URL=\n");
    content.push_str(&format!("DB_PATH={}\n", base.join("zapwatch.db").display()));
    content.push_str(&format!("SESSION_KEY_PATH={}\n", base.join("session.key").display()));
    content.push_str("TOR_SOCKS=\n");
    content.push_str("BUNKER_KEEPALIVE_SECS=14400\n");
    content.push_str("VERIFY_SIG=1\n");
    fs::write(env_path, content)?;
    Ok(())
}

/// Set `key=value` in the env file, replacing an existing line or appending.
fn write_key_to_env(env_path: &str, key: &str, value: &str) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let prefix = format!("{key}=");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with(&prefix) {
            new_content.push_str(&format!("{key}={value}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("{key}={value}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var(key, value);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
