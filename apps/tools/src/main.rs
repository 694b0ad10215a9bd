use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::protocol::PairingUri;
use storage::{PreferenceStore, Storage};
use tracing::info;
use wallet_core::load_settings;

#[derive(Parser, Debug)]
struct Cli {
    /// Defaults to `preferences_database_url` from the resolved settings.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Show,
    Clear,
    InspectUri { uri: String },
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();

    match cli.command {
        Command::Show => {
            let storage = open_storage(cli.database_url, &settings.preferences_database_url).await?;
            let snapshot = storage.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Clear => {
            let storage = open_storage(cli.database_url, &settings.preferences_database_url).await?;
            storage.clear().await?;
            storage.clear_relay_address().await?;
            println!("cleared preferred wallet and relay address");
        }
        Command::InspectUri { uri } => {
            let pairing = PairingUri::parse(&uri).context("invalid pairing uri")?;
            println!("topic={}", pairing.topic);
            println!("version={}", pairing.version);
            println!("relay_protocol={}", pairing.relay_protocol);
            match pairing.expiry {
                Some(expiry) => println!("expiry={}", expiry.to_rfc3339()),
                None => println!("expiry=none"),
            }
        }
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

async fn open_storage(flag: Option<String>, configured: &str) -> Result<Storage> {
    let database_url = flag.unwrap_or_else(|| configured.to_string());
    info!(database_url = %database_url, "tools: opening preference store");
    Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open preference store at {database_url}"))
}
