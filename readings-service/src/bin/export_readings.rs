use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use meter_store::PartitionStore;
use readings_service::{
    config::AppConfig,
    encoders::{delimiter_byte, EncoderSink, OutputFormat},
    error::ServiceError,
    export::{ExportFilter, ExportRecord, ReadingExport, TimeRange},
    observability,
    pipeline::Pipeline,
};

/// Export every reading, sorted, as CSV and/or JSON lines.
#[derive(Debug, Parser)]
#[command(name = "export_readings")]
struct Args {
    /// Output directory (defaults to the configured one)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Write a delimited text file
    #[arg(long)]
    csv: bool,

    /// Write a JSON lines file
    #[arg(long)]
    json: bool,

    /// CSV field delimiter, e.g. ';' for spreadsheets that use decimal commas
    #[arg(long)]
    delimiter: Option<char>,

    /// Inclusive start, UTC: YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS]
    #[arg(long)]
    start: Option<String>,

    /// Inclusive end, UTC. A bare date covers the whole day
    #[arg(long)]
    end: Option<String>,

    /// Only export this meter; repeat to export several, in order
    #[arg(long = "meter")]
    meters: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();

    let mut formats = Vec::new();
    if args.csv {
        formats.push(OutputFormat::Tabular);
    }
    if args.json {
        formats.push(OutputFormat::JsonLines);
    }
    if formats.is_empty() {
        eprintln!("nothing to export: pass --csv and/or --json");
        return Ok(());
    }

    let filter = ExportFilter {
        range: TimeRange::parse(args.start.as_deref(), args.end.as_deref())?,
        meters: args.meters,
    };

    let cfg = AppConfig::load()?;
    let out_dir = args.out_dir.unwrap_or_else(|| cfg.export.out_dir.clone());
    let delimiter = delimiter_byte(args.delimiter.unwrap_or(cfg.export.delimiter))?;

    let store = cfg.store.connect().await?;
    let (sink, outputs) = EncoderSink::create(&out_dir, &formats, &filter, delimiter)?;

    let pipeline: Pipeline<_, ExportRecord, _> = Pipeline::new(ReadingExport::new(&store, filter), sink);
    let result = pipeline.run().await;
    store.close().await?;

    let written = match result {
        Ok(written) => written,
        Err(ServiceError::IndexRequired(msg)) => {
            tracing::error!("the store needs a composite index on the 'items' collection group (f_meter_id, f_ts_utc); create it and re-run");
            anyhow::bail!(msg);
        }
        Err(e) => return Err(e.into()),
    };

    for output in &outputs {
        println!("{:?}: {written} records -> {}", output.format, output.path.display());
    }
    Ok(())
}
