//! Storefront sync monitor
//!
//! Opens a sync session against a storefront backend and prints every
//! user-visible change as a structured log line:
//! - CLI arguments and TOML config file support
//! - Order list, single order and chat views
//! - Connection and store status report

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use storefront_sync::{
    helpers::ws_url_from_http, init_logging, ConnectionManager, FileTokenStore, LogFormat,
    MemoryTokenStore, Notification, PushChannel, RestClient, Session, SessionSettings,
    StorefrontApi, SyncConfig, SyncContext, TokenStore,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "storefront_sync")]
#[command(version, about = "Storefront live sync monitor", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "storefront_sync.toml")]
    config: String,

    /// Override REST base URL
    #[arg(long, env = "STOREFRONT_API_URL")]
    base_url: Option<String>,

    /// Override push channel URL (default: derived from the base URL)
    #[arg(long, env = "STOREFRONT_WS_URL")]
    ws_url: Option<String>,

    /// Auth token (overrides the token file)
    #[arg(long, env = "STOREFRONT_TOKEN")]
    token: Option<String>,

    /// Token file path (overrides config)
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Log filter, e.g. "info,sync::router=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    /// Roll back optimistic changes unconfirmed after this many seconds
    #[arg(long, default_value_t = 30)]
    intent_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the signed-in user's order list
    WatchOrders,
    /// Follow one order
    WatchOrder {
        /// Order identifier
        id: String,
    },
    /// Follow one chat conversation
    WatchChat {
        /// Chat identifier
        chat_id: String,
    },
    /// Connect, fetch once and print connection and store status
    Status,
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "storefront_sync.toml")]
        output: String,
    },
    /// Validate config without running
    ValidateConfig,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if it exists (before parsing CLI args)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match &cli.command {
        Commands::GenerateConfig { output } => {
            generate_sample_config(output)?;
            return Ok(());
        }
        Commands::ValidateConfig => {
            let config = load_config(&cli)?;
            println!("Configuration is valid:\n{:#?}", config);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli)?;
    let _log_guards = init_logging(&config.logging, cli.log_level.as_deref())?;

    let tokens = token_store(&cli, &config);
    let api: Arc<dyn StorefrontApi> = Arc::new(RestClient::new(
        config.backend.base_url.clone(),
        config.backend.request_timeout(),
        Arc::clone(&tokens),
    )?);
    let channel: Arc<dyn PushChannel> = Arc::new(ConnectionManager::with_config(
        config.backend.ws_url.clone(),
        config.connection.to_connection_config(),
    ));
    let settings = SessionSettings::from_config(&config)?;

    info!(
        base_url = %config.backend.base_url,
        ws_url = %config.backend.ws_url,
        "Opening sync session"
    );
    let (session, mut notifications) = Session::open(api, channel, tokens, settings).await?;

    let mut context: SyncContext = match &cli.command {
        Commands::WatchOrders => session.orders_context().await?,
        Commands::WatchOrder { id } => session.order_context(id).await?,
        Commands::WatchChat { chat_id } => session.chat_context(chat_id).await?,
        Commands::Status | Commands::GenerateConfig { .. } | Commands::ValidateConfig => {
            let result = show_status(&session).await;
            session.teardown().await;
            return result;
        }
    };
    info!(context = context.name(), state = %context.state(), "Watching, press Ctrl+C to stop");

    let intent_timeout = Duration::from_secs(cli.intent_timeout_secs.max(1));
    let mut reaper = tokio::time::interval(intent_timeout);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = reaper.tick() => {
                session.expire_pending(intent_timeout);
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    warn!("Notification stream ended");
                    break;
                };
                print_notification(&notification);
            }
        }
    }

    context.close();
    session.teardown().await;
    info!("Stopped");
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config(cli: &Cli) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let mut config = SyncConfig::load(Path::new(&cli.config))?;

    // CLI flags override file values
    if let Some(base_url) = &cli.base_url {
        config.backend.base_url = base_url.clone();
        if cli.ws_url.is_none() {
            if let Some(ws_url) = ws_url_from_http(base_url) {
                config.backend.ws_url = ws_url;
            }
        }
    }
    if let Some(ws_url) = &cli.ws_url {
        config.backend.ws_url = ws_url.clone();
    }
    if let Some(token_file) = &cli.token_file {
        config.backend.token_file = Some(token_file.clone());
    }
    if let Some(format) = cli.log_format.as_deref() {
        config.logging.stdout_format = match format {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            "pretty" => LogFormat::Pretty,
            other => return Err(format!("Unknown log format '{other}'. Use: pretty, json, compact").into()),
        };
    }
    config.validate()?;
    Ok(config)
}

fn token_store(cli: &Cli, config: &SyncConfig) -> Arc<dyn TokenStore> {
    if let Some(token) = &cli.token {
        return Arc::new(MemoryTokenStore::new(Some(token.clone())));
    }
    match &config.backend.token_file {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(MemoryTokenStore::default()),
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::OrderStatusChanged {
            order_id,
            previous,
            current,
        } => info!(%order_id, ?previous, ?current, "Order status changed"),
        Notification::PaymentStatusChanged { order_id, current } => {
            info!(%order_id, ?current, "Payment status changed")
        }
        Notification::OrderUpdated { order_id } => info!(%order_id, "Order updated"),
        Notification::MessageReceived {
            chat_id,
            message_id,
        } => info!(%chat_id, %message_id, "New message"),
        Notification::MessageConfirmed {
            chat_id,
            provisional_id,
            message_id,
        } => info!(%chat_id, %provisional_id, %message_id, "Message delivered"),
        Notification::MessagesRead { chat_id, count } => info!(%chat_id, count, "Messages read"),
        Notification::TypingChanged {
            chat_id,
            user_id,
            typing,
        } => info!(%chat_id, %user_id, typing, "Typing"),
        Notification::MutationRejected {
            entity_kind,
            entity_id,
            reason,
        } => warn!(entity_kind, %entity_id, %reason, "Change rejected"),
        Notification::SyncLost {
            context,
            consecutive_failures,
        } => warn!(%context, consecutive_failures, "Sync lost"),
        Notification::SyncRestored { context } => info!(%context, "Sync restored"),
        Notification::Link(event) => info!(?event, "Push channel"),
    }
}

/// Print connection health and what one fetch of each store returns.
async fn show_status(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    let mut context = session.orders_context().await?;
    // the order poller fetches immediately
    tokio::time::sleep(Duration::from_millis(500)).await;
    context.close();

    let health = session.channel().health().summary();
    println!("Push channel:        {}", health.state);
    println!(
        "Last push:           {}",
        health
            .secs_since_last_push
            .map(|s| format!("{s:.1}s ago"))
            .unwrap_or_else(|| "never".to_string())
    );
    println!("Reconnect failures:  {}", health.consecutive_failures);

    let orders = session.order_list();
    println!("Orders:              {}", orders.len());
    for order in orders.iter().take(10) {
        println!("  {:<24} {:<12} {:?}", order.id, order.status.to_string(), order.payment_status);
    }

    match session.refresh_cart().await {
        Ok(cart) => println!(
            "Cart:                {} items, total {:.2}",
            cart.item_count(),
            cart.total()
        ),
        Err(e) => println!("Cart:                unavailable ({e})"),
    }
    Ok(())
}

fn generate_sample_config(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sample = SyncConfig::default();
    let content = sample.to_toml()?;

    let with_comments = format!(
        r#"# Storefront sync configuration
# See: storefront_sync --help

{}

# Auth token file ({{"token": "..."}}), or set STOREFRONT_TOKEN:
# [backend]
# token_file = "token.json"

# Extra push event names:
# [router.aliases]
# order_status_changed = ["orderStateChanged"]
"#,
        content
    );

    std::fs::write(path, with_comments)?;
    println!("Sample config written to: {}", path);
    Ok(())
}
