//! CLI for Agency operations

use agencycomm::agency::{AgencyClient, CasCondition, InMemoryAgency, LockType};
use agencycomm::common::parse_duration;
use agencycomm::{AgencyCommResult, AgencyConfig};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agencyctl")]
#[command(about = "Agency coordination store client")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agency endpoint (repeatable), overrides the config file
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Global key prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Use a throwaway in-process store instead of a real Agency
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get {
        key: String,

        #[arg(long)]
        recursive: bool,
    },

    /// Write a value (JSON, or a plain string)
    Set {
        key: String,
        value: String,

        /// Expire after this long (e.g. 30s)
        #[arg(long, value_parser = parse_duration)]
        ttl: Option<Duration>,
    },

    /// Delete a key
    Rm {
        key: String,

        #[arg(long)]
        recursive: bool,
    },

    /// Compare-and-swap a value
    Cas {
        key: String,
        value: String,

        /// Expected current value
        #[arg(long, conflicts_with = "create")]
        prev: Option<String>,

        /// Only write if the key does not exist
        #[arg(long)]
        create: bool,

        #[arg(long, value_parser = parse_duration)]
        ttl: Option<Duration>,
    },

    /// Wait for a change below a key
    Watch {
        key: String,

        /// Report changes at or after this index
        #[arg(long, default_value = "0")]
        index: u64,

        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        timeout: Duration,

        #[arg(long)]
        recursive: bool,
    },

    /// Reserve a block of unique ids
    Uniqid {
        #[arg(default_value = "Sync/LatestID")]
        key: String,

        #[arg(long, default_value = "1")]
        count: u64,
    },

    /// Take a lock, hold it, release it
    Lock {
        key: String,

        /// Read lock instead of write lock
        #[arg(long)]
        read: bool,

        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        ttl: Duration,

        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        hold: Duration,
    },

    /// Create the default namespace unless it exists
    Init,

    /// Print the Agency version document
    Version,
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_result(result: &AgencyCommResult) -> anyhow::Result<()> {
    if !result.successful() {
        anyhow::bail!("request failed: {}", result.error_details());
    }
    for (key, entry) in &result.values {
        println!("{} = {}", if key.is_empty() { "." } else { key }, entry.value);
    }
    println!("index: {}", result.index);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = AgencyConfig::load(cli.config.as_deref()).context("loading config")?;
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.prefix = prefix.clone();
    }

    let client = if cli.memory {
        if config.endpoints.is_empty() {
            config.endpoints.push("tcp://127.0.0.1:4001".into());
        }
        AgencyClient::with_transport(config, Arc::new(InMemoryAgency::new()))?
    } else {
        if config.endpoints.is_empty() {
            anyhow::bail!("no agency endpoints configured (use --endpoint or AGENCY_ENDPOINTS)");
        }
        AgencyClient::new(config)?
    };

    if !client.try_connect().await {
        anyhow::bail!("no agency endpoint available");
    }

    match cli.command {
        Commands::Get { key, recursive } => {
            print_result(&client.get_values(&key, recursive).await?)?;
        }

        Commands::Set { key, value, ttl } => {
            let result = client
                .set_value(&key, &parse_value(&value), ttl.unwrap_or_default())
                .await?;
            print_result(&result)?;
        }

        Commands::Rm { key, recursive } => {
            print_result(&client.remove_values(&key, recursive).await?)?;
        }

        Commands::Cas {
            key,
            value,
            prev,
            create,
            ttl,
        } => {
            let condition = match prev {
                Some(prev) => CasCondition::prev_value(&parse_value(&prev)),
                None if create => CasCondition::must_not_exist(),
                None => anyhow::bail!("cas needs --prev or --create"),
            };
            let result = client
                .cas_value(&key, &condition, &parse_value(&value), ttl.unwrap_or_default(), Duration::ZERO)
                .await?;
            print_result(&result)?;
        }

        Commands::Watch {
            key,
            index,
            timeout,
            recursive,
        } => {
            let result = client.watch_value(&key, index, timeout, recursive).await?;
            if result.connected && result.status_code == 0 {
                println!("no change within {:?}", timeout);
            } else {
                print_result(&result)?;
            }
        }

        Commands::Uniqid { key, count } => {
            let result = client.uniqid(&key, count, Duration::ZERO).await?;
            if !result.successful() {
                anyhow::bail!("uniqid failed: {}", result.error_details());
            }
            println!("{}", result.index);
        }

        Commands::Lock { key, read, ttl, hold } => {
            let lock_type = if read { LockType::Read } else { LockType::Write };
            let scope = client
                .lock_scoped(&key, lock_type, ttl, Duration::ZERO)
                .await
                .with_context(|| format!("could not acquire {} lock on {}", lock_type, key))?;
            println!("{} lock on {} held (version {})", lock_type, key, scope.version());
            tokio::time::sleep(hold).await;
            if !scope.release().await {
                anyhow::bail!("releasing lock on {} failed", key);
            }
            println!("released");
        }

        Commands::Init => {
            if client.ensure_structure_initialized().await {
                println!("initialized under {}", client.prefix());
            }
        }

        Commands::Version => {
            println!("{}", client.agency_version().await?);
        }
    }

    client.cleanup().await;
    Ok(())
}
