use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meter_store::{domain::meter::fields as meter_fields, domain::Meter, db::FieldAccess, PartitionStore};
use readings_service::{
    bootstrap::{BootstrapLoader, Workbook},
    config::AppConfig,
    error::ServiceError,
    export::{parse_bound, Bound},
    observability,
    simulate::{Frequency, MeterSelection, SimulationPlan, Simulator},
    writer::ReadingWriter,
};

/// Load the meter hierarchy and write readings.
#[derive(Debug, Parser)]
#[command(name = "seed_meters")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upsert locations, condominiums, clients and meters from a workbook
    /// directory of CSV sheets
    Bootstrap {
        #[arg(long)]
        workbook: PathBuf,
    },
    /// Generate synthetic readings for existing meters
    Simulate {
        /// Inclusive start, UTC
        #[arg(long)]
        start: String,
        /// Inclusive end, UTC
        #[arg(long)]
        end: String,
        /// One of 5m, 15m, 1h, 6h, 1d
        #[arg(long, default_value = "1h")]
        freq: String,
        /// Simulate these meters (repeatable)
        #[arg(long = "meter")]
        meters: Vec<String>,
        /// Otherwise simulate the first N meters
        #[arg(long, default_value_t = 3)]
        limit_meters: usize,
    },
    /// Write a single reading
    Record {
        #[arg(long)]
        meter: String,
        /// Reading time, UTC
        #[arg(long)]
        ts: String,
        /// Volume delta in cubic metres
        #[arg(long)]
        volume: f64,
        /// Defaults to the meter's client
        #[arg(long)]
        client: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();

    let cfg = AppConfig::load()?;

    match args.command {
        Command::Bootstrap { workbook } => {
            let workbook = Workbook::open(&workbook)?;
            let store = cfg.store.connect().await?;
            let result = BootstrapLoader::new(&store).load(&workbook).await;
            store.close().await?;

            let report = result?;
            for (sheet, r) in &report.sheets {
                println!(
                    "{:<12} created={} updated={} unchanged={} failed={}",
                    sheet.collection(),
                    r.created,
                    r.updated,
                    r.unchanged,
                    r.failed
                );
            }
        }
        Command::Simulate {
            start,
            end,
            freq,
            meters,
            limit_meters,
        } => {
            let plan = SimulationPlan {
                start: parse_bound(&start, Bound::Start)?,
                end: parse_bound(&end, Bound::End)?,
                frequency: freq.parse()?,
                meters: if meters.is_empty() {
                    MeterSelection::First(limit_meters)
                } else {
                    MeterSelection::Ids(meters)
                },
            };

            let store = cfg.store.connect().await?;
            let result = Simulator::new(&store).run(&plan).await;
            store.close().await?;
            println!("{} readings written", result?);
        }
        Command::Record {
            meter,
            ts,
            volume,
            client,
        } => {
            let ts = parse_bound(&ts, Bound::Start)?;
            let store = cfg.store.connect().await?;
            let result = record(&store, &meter, client, ts, volume).await;
            store.close().await?;

            let item = result.with_context(|| format!("recording reading for meter {meter}"))?;
            println!("{item}");
        }
    }
    Ok(())
}

async fn record<S: PartitionStore>(
    store: &S,
    meter_id: &str,
    client: Option<String>,
    ts: time::OffsetDateTime,
    volume: f64,
) -> Result<meter_store::DocPath, ServiceError> {
    let client = match client {
        Some(client) => Some(client),
        None => store
            .get(&Meter::path(meter_id).map_err(ServiceError::bad_id)?)
            .await?
            .and_then(|doc| doc.str_field(meter_fields::CLIENT_ID).map(str::to_string)),
    };
    ReadingWriter::new(store)
        .write_reading(meter_id, client.as_deref(), ts, volume)
        .await
}
