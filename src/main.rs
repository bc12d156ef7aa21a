//! Binary entrypoint for the Meshgram CLI.
//!
//! Commands:
//! - `start` - run the bridge until Ctrl-C
//! - `init` - write a starter `config.toml` (never overwrites)
//! - `check` - load and validate the configuration, then print a summary
//!
//! See the library crate docs for module-level details: `meshgram::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshgram::bridge::Bridge;
use meshgram::config::Config;

#[derive(Parser)]
#[command(name = "meshgram")]
#[command(about = "Meshtastic MQTT to Telegram bridge with MQTT proxy forwarding")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start,
    /// Write a default configuration file
    Init,
    /// Validate the configuration and print a summary
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            println!(
                "Wrote {}. Set telegram.bot_token (or TELEGRAM_BOT_TOKEN) before starting.",
                cli.config
            );
        }
        Commands::Check => {
            let config = load_config(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            print_summary(&config);
        }
        Commands::Start => {
            let config = load_config(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting Meshgram v{}", env!("CARGO_PKG_VERSION"));
            Bridge::new(config)?.run().await?;
        }
    }
    Ok(())
}

async fn load_config(path: &str) -> Result<Config> {
    let mut config = Config::load(path).await?;
    config.apply_env_overrides()?;
    Ok(config)
}

fn print_summary(config: &Config) {
    println!("Configuration OK");
    println!(
        "Source broker: {}:{} (topic {}, qos {})",
        config.source.host, config.source.port, config.source.topic, config.source.qos
    );
    match config.telegram.group_chat_id {
        Some(id) => println!("Group chat: {}", id),
        None => println!("Group chat: not configured"),
    }
    if config.telegram.allowed_user_ids.is_empty() {
        println!("Allowed users: everyone");
    } else {
        println!("Allowed users: {}", config.telegram.allowed_user_ids.len());
    }
    println!(
        "Grouping: quiet {} ms, max window {} ms",
        config.grouping.quiet_period_ms, config.grouping.max_window_ms
    );
    if config.proxy_targets.is_empty() {
        println!("Proxy targets: none");
    }
    for t in &config.proxy_targets {
        println!(
            "Proxy target {}: {}:{} prefix '{}' qos {}{}",
            t.name,
            t.host,
            t.port,
            t.topic_prefix,
            t.qos,
            if t.enabled { "" } else { " (disabled)" }
        );
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if verbosity < 2 {
        // rumqttc is chatty at debug level
        builder.filter_module("rumqttc", log::LevelFilter::Warn);
    }

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Write to both file and console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
