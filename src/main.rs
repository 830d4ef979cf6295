//! # Posterly: Scheduled WhatsApp Poster Delivery
//!
//! Usage:
//!   posterly serve                                   # Run the delivery engine
//!   posterly schedule -c cust-1 -p poster-1 -k offers --at "2025-03-10 09:00"
//!   posterly list --status failed                    # Dashboard view
//!   posterly cancel <id>                             # Cancel a pending delivery
//!   posterly customer add --phone 9876543210 --name "Asha Traders"
//!   posterly poster add --customer cust-1 --media holi/banner.png
//!   posterly config init                             # Write default config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use posterly_core::config::PosterlyConfig;
use posterly_core::time::{Clock, SystemClock};
use posterly_core::types::{Category, Customer, DeliveryStatus, Poster};
use posterly_scheduler::{
    DeliveryEngine, DeliveryStore, DueSpec, ListFilter, Reconciler, ScheduleRequest, Scheduler,
    SqliteStore, reconciler, spawn_engine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "posterly",
    version,
    about = "📮 Posterly: scheduled WhatsApp poster delivery"
)]
struct Cli {
    /// Config file (default: ~/.posterly/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the delivery engine until Ctrl-C
    Serve,
    /// Schedule posters for a customer (every poster × category × time)
    Schedule {
        #[arg(short, long)]
        customer: String,
        #[arg(short, long = "poster", required = true)]
        posters: Vec<String>,
        #[arg(short = 'k', long = "category", required = true)]
        categories: Vec<Category>,
        /// RFC 3339, epoch seconds/millis, or "YYYY-MM-DD HH:mm" in the configured zone
        #[arg(long = "at", required = true)]
        times: Vec<String>,
    },
    /// Cancel a pending delivery
    Cancel { id: String },
    /// List deliveries
    List {
        #[arg(long)]
        status: Option<DeliveryStatus>,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage customers
    Customer {
        #[command(subcommand)]
        action: CustomerAction,
    },
    /// Manage posters
    Poster {
        #[command(subcommand)]
        action: PosterAction,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CustomerAction {
    Add {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        company: String,
    },
}

#[derive(Subcommand)]
enum PosterAction {
    Add {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        customer: String,
        /// Path relative to `delivery.media_base_url`, or an absolute URL
        #[arg(long)]
        media: String,
        #[arg(long)]
        caption: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: &Option<String>) -> Result<PosterlyConfig> {
    let config = match path {
        Some(p) => {
            let path = expand_path(p);
            if path.exists() {
                PosterlyConfig::load_from(&path)?
            } else {
                PosterlyConfig::default().with_env_overrides()
            }
        }
        None => PosterlyConfig::load()?,
    };
    // Fail fast on an unknown zone.
    config.canonical_tz()?;
    Ok(config)
}

fn open_store(config: &PosterlyConfig) -> Result<Arc<SqliteStore>> {
    let db_path = expand_path(&config.storage.db_path);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "posterly=debug,posterly_core=debug,posterly_providers=debug,posterly_scheduler=debug"
    } else {
        "posterly=info,posterly_core=info,posterly_providers=info,posterly_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if let Command::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        let path = cli
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(PosterlyConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        PosterlyConfig::default().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let store = open_store(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tz = config.canonical_tz()?;

    match cli.command {
        Command::Serve => {
            let messenger = Arc::new(posterly_providers::create_chain(&config)?);
            let engine = Arc::new(DeliveryEngine::from_config(
                &config,
                store.clone(),
                store.clone(),
                messenger,
                clock,
            )?);

            let (tx, rx) = tokio::sync::watch::channel(false);
            let handle = spawn_engine(engine, rx);

            tokio::signal::ctrl_c().await?;
            tracing::info!("👋 Shutting down");
            tx.send(true).ok();
            handle.await?;
        }
        Command::Schedule {
            customer,
            posters,
            categories,
            times,
        } => {
            let scheduler = Scheduler::new(store.clone(), store.clone(), tz, clock);
            let records = scheduler
                .schedule(&ScheduleRequest {
                    target_id: customer,
                    payload_refs: posters,
                    categories,
                    times: times.into_iter().map(DueSpec::DateTime).collect(),
                })
                .await?;
            for r in &records {
                println!("📅 {}  {}  {}  {}", r.id, r.slot(), r.category.as_str(), r.payload_ref);
            }
            println!("✅ {} deliveries scheduled ({})", records.len(), tz.name());
        }
        Command::Cancel { id } => {
            if store.cancel(&id, clock.now()).await? {
                println!("🚫 Cancelled {id}");
            } else {
                match store.get(&id).await? {
                    Some(r) => println!("⚠️  {id} is {} and cannot be cancelled", r.status),
                    None => println!("⚠️  No delivery {id}"),
                }
            }
        }
        Command::List {
            status,
            customer,
            limit,
            json,
        } => {
            let records = store
                .list(&ListFilter {
                    status,
                    target_id: customer,
                    limit,
                })
                .await?;
            let views = Reconciler::new(store.clone(), tz, &config.delivery.media_base_url)
                .project(&records)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                for v in &views {
                    println!(
                        "{:<36}  {:<9}  {:<30}  {:<20}  {}",
                        v.id,
                        v.status.as_str(),
                        v.scheduled_for,
                        v.customer_name,
                        v.failure_reason.as_deref().unwrap_or("")
                    );
                }
                let s = reconciler::summary(&records);
                println!(
                    "\n{} shown: {} pending, {} sending, {} sent, {} failed, {} cancelled",
                    s.total(),
                    s.pending,
                    s.sending,
                    s.sent,
                    s.failed,
                    s.cancelled
                );
            }
        }
        Command::Customer {
            action:
                CustomerAction::Add {
                    id,
                    phone,
                    name,
                    company,
                },
        } => {
            let customer = Customer {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                contact_number: phone,
                display_name: name,
                company_name: company,
            };
            store.upsert_customer(&customer)?;
            println!("✅ Customer {} saved", customer.id);
        }
        Command::Poster {
            action:
                PosterAction::Add {
                    id,
                    customer,
                    media,
                    caption,
                },
        } => {
            let poster = Poster {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                customer_id: customer,
                media_path: media,
                caption,
            };
            store.upsert_poster(&poster)?;
            match reconciler::media_url(&config.delivery.media_base_url, &poster.media_path) {
                Some(url) => println!("✅ Poster {} saved ({url})", poster.id),
                None => println!("⚠️  Poster {} saved without a usable media URL", poster.id),
            }
        }
        Command::Config { .. } => {}
    }

    Ok(())
}
