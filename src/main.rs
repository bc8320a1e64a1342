use anyhow::{Context, Result};
use clap::Parser;
use feedrelay::config::Config;
use feedrelay::delivery::queue::delivery_channel;
use feedrelay::delivery::telegram::TelegramClient;
use feedrelay::delivery::ChatSender;
use feedrelay::formatter::Formatter;
use feedrelay::parser::EventParser;
use feedrelay::pipeline::Pipeline;
use feedrelay::stream::manager::ConnectionManager;
use feedrelay::stream::websocket::WebSocketConnector;
use feedrelay::stream::StreamConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "feedrelay",
    version,
    about = "Relay a real-time X/Twitter event stream into Telegram"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "FEEDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration (token redacted) and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(cli: &Cli) -> Result<Config> {
    // A missing .env is fine.
    let _ = dotenv::dotenv();

    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    config
        .apply_env_overrides(|name| std::env::var(name).ok())
        .context("reading environment overrides")?;
    Ok(config)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config: Config) -> Result<()> {
    let zone = config.display_zone()?;

    let telegram = TelegramClient::new(
        &config.telegram.api_base,
        config.telegram.bot_token.clone(),
        Duration::from_millis(config.telegram.request_timeout_ms),
    );
    let bot = telegram
        .verify()
        .await
        .context("verifying telegram bot token")?;
    tracing::info!(bot_id = bot.id, username = ?bot.username, "telegram bot verified");

    let sender: Arc<dyn ChatSender> = Arc::new(telegram);
    let (queue, drainer) =
        delivery_channel(sender, config.telegram.chat_id.clone(), config.poll_interval());
    let pipeline = Pipeline::new(
        EventParser::new(zone),
        Formatter::new(
            config.format.max_message_length,
            config.format.batch_display_size,
            zone,
        ),
        queue,
        config.latency_threshold_ms(),
    );
    let connector: Arc<dyn StreamConnector> =
        Arc::new(WebSocketConnector::new(config.websocket_settings()));

    let manager = Arc::new(ConnectionManager::new(
        connector,
        pipeline,
        drainer,
        config.manager_settings(),
    ));

    let on_signal = Arc::clone(&manager);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        on_signal.stop().await;
    });

    tracing::info!(url = %config.stream.url, "relay starting");
    let outcome = manager.start().await;

    let snapshot = manager.snapshot();
    tracing::info!(
        messages = snapshot.messages,
        connects = snapshot.connects,
        delivered = snapshot.delivery.delivered,
        failed = snapshot.delivery.failed,
        "relay stopped"
    );

    outcome?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("feedrelay: {:#}", e);
            std::process::exit(1);
        }
    };

    if cli.print_config {
        let mut shown = config.clone();
        if !shown.telegram.bot_token.is_empty() {
            shown.telegram.bot_token = "<redacted>".to_string();
        }
        match toml::to_string_pretty(&shown) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("feedrelay: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = feedrelay::logging::init(&config.logging) {
        eprintln!("feedrelay: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
