use anyhow::Result;
use clap::Parser;
use meter_store::PartitionStore;
use readings_service::{config::AppConfig, observability, purge};

/// Delete every reading, month bucket and hierarchy record.
#[derive(Debug, Parser)]
#[command(name = "purge_store")]
struct Args {
    /// Actually delete; without it the command only says what it would do
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();

    let cfg = AppConfig::load()?;
    if !args.yes {
        eprintln!(
            "refusing to purge without --yes: this removes all items, month buckets and the {} collections",
            purge::ROOT_COLLECTIONS.join(", ")
        );
        return Ok(());
    }

    let store = cfg.store.connect().await?;
    let result = purge::purge(&store).await;
    store.close().await?;

    let report = result?;
    println!("items: {}", report.items);
    println!("buckets: {}", report.buckets);
    for (collection, deleted) in &report.roots {
        println!("{collection}: {deleted}");
    }
    Ok(())
}
