use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fitrec_core::ProductId;
use fitrec_storage::CatalogStore;
use fitrec_sync::{choose_survivor, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fitrec-cli")]
#[command(about = "FitRec review cache and product dedup maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh every expired review cache entry once. Ctrl-C stops between products.
    Sweep,
    /// List products whose cached reviews have expired.
    Due,
    /// Report same-brand duplicate product candidates.
    Duplicates {
        /// Merge every candidate pair, keeping the older product.
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        json: bool,
    },
    /// Repoint references from `delete` to `keep`, then remove `delete`.
    Merge { keep: ProductId, delete: ProductId },
    /// Show the cache state for one product.
    Status { product_id: ProductId },
    /// Drop a product's cached reviews so the next read fetches live.
    ClearCache { product_id: ProductId },
    Migrate,
    /// Run the HTTP API (and the weekly sweep when the scheduler is enabled).
    Serve,
    /// Run only the weekly sweep scheduler until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Sweep => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing current product");
                    let _ = tx.send(true);
                }
            });
            let summary = engine.scheduler().run_sweep_with_shutdown(rx).await?;
            println!(
                "sweep complete: run_id={} total={} refreshed={} errored={} skipped={}",
                summary.run_id, summary.total, summary.refreshed, summary.errored, summary.skipped
            );
        }
        Commands::Due => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let due = engine.scheduler().list_due_products().await?;
            println!("{} product(s) due for refresh", due.len());
            for id in due {
                println!("{id}");
            }
        }
        Commands::Duplicates { apply, json } => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let pairs = engine.find_duplicates().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pairs)?);
            } else {
                for pair in &pairs {
                    println!(
                        "brand={} {} <-> {} score={:.3}",
                        pair.brand_id, pair.product_a, pair.product_b, pair.score
                    );
                }
                println!("{} candidate pair(s)", pairs.len());
            }

            if apply {
                let mut merged = 0usize;
                for pair in &pairs {
                    let catalog = engine.catalog();
                    let (Some(a), Some(b)) = (
                        catalog.get_product(pair.product_a).await?,
                        catalog.get_product(pair.product_b).await?,
                    ) else {
                        // One side was already merged away by an earlier pair.
                        continue;
                    };
                    let (keep, delete) = choose_survivor(&a, &b);
                    let report = engine.merge_products(keep, delete).await?;
                    info!(keep, delete, repointed = report.repointed, "auto-merged duplicate");
                    merged += 1;
                }
                println!("merged {merged} duplicate(s)");
            }
        }
        Commands::Merge { keep, delete } => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let report = engine.merge_products(keep, delete).await?;
            println!(
                "merged product {} into {}: {} reference(s) repointed",
                report.delete_id, report.keep_id, report.repointed
            );
        }
        Commands::Status { product_id } => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let status = engine.cache().status(product_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::ClearCache { product_id } => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            if engine.cache().clear(product_id).await? {
                println!("cleared review cache for product {product_id}");
            } else {
                println!("product {product_id} had no cached reviews");
            }
        }
        Commands::Migrate => {
            let store = fitrec_sync::connect_store(&config).await?;
            store.health_check().await.context("checking database connection")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let scheduler = fitrec_sync::maybe_build_scheduler(&config, engine.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            let state = fitrec_web::AppState::new(engine, config.admin_token.clone());
            fitrec_web::serve(state, config.web_port).await?;
        }
        Commands::Schedule => {
            let engine = fitrec_sync::engine_from_config(&config).await?;
            let Some(mut sched) = fitrec_sync::maybe_build_scheduler(&config, engine).await? else {
                bail!("scheduler disabled; set FITREC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
