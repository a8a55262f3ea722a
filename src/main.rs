use clap::Parser;
use lib::{InputFormat, PipelineConfig, SimpleLogger, run};
use log::{debug, error};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trip records to import (CSV with a header row, or Parquet)
    #[arg(short, long)]
    input: PathBuf,

    /// CSV file receiving duplicate trips, overwritten on each run
    #[arg(short, long, default_value = "duplicates.csv")]
    duplicates: PathBuf,

    /// SQLite database holding the Trips table
    #[arg(long, env = "TAXI_IMPORTER_DATABASE", default_value = "taxi.db")]
    database: PathBuf,

    /// Civil time zone of the input timestamps (IANA or Windows name)
    #[arg(long, default_value = "America/New_York")]
    timezone: String,

    /// Zone identifier tried when --timezone is not recognized
    #[arg(long, default_value = "US/Eastern")]
    timezone_fallback: String,

    /// Input format; detected from the file extension when omitted
    #[arg(long)]
    format: Option<InputFormat>,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log level for output
    #[arg(long, default_value = "false")]
    debug: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        PipelineConfig {
            input: self.input,
            duplicates: self.duplicates,
            database: self.database,
            timezone: self.timezone,
            timezone_fallback: self.timezone_fallback,
            format: self.format,
            report: self.report,
        }
    }
}

fn main() -> ExitCode {
    let total_start = Instant::now();
    let args = Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    let config = args.into_config();
    println!("Starting processing...");
    debug!(
        "Input: {} ({:?}) | Duplicates: {} | Database: {}",
        config.input.display(),
        config.input_format(),
        config.duplicates.display(),
        config.database.display()
    );

    match run(&config) {
        Ok(report) => {
            println!(
                "\nProcessed {} rows: {} loaded, {} duplicates written to {}",
                report.total_rows,
                report.rows_written,
                report.duplicates,
                config.duplicates.display()
            );
            println!("Done! Total runtime: {:.2?}", total_start.elapsed());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Critical Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
