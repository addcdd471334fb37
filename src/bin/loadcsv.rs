use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;

use mysql_cdc::cache::Rcache;
use mysql_cdc::config::DumpConfig;
use mysql_cdc::error::{CdcError, Result};
use mysql_cdc::load::load_csv;
use mysql_cdc::logging;

/// Re-injects a dumped CSV into the staging cache (recovery and
/// replay).
#[derive(Parser)]
#[command(name = "loadcsv", version)]
struct Args {
    /// CSV file to load, named like "db.table[.suffix].csv"
    csv_file: PathBuf,
    /// Key columns of the CSV's table, in declared order
    #[arg(required = true)]
    primary_key: Vec<String>,
    /// MySQL server id of the pipeline
    #[arg(short = 's', long = "server_id")]
    server_id: Option<u32>,
    /// Cache url like "redis://host:port/db"
    #[arg(short = 'u', long = "cache_url")]
    cache_url: Option<String>,
    /// Config file instead of the discrete flags
    #[arg(short = 'c', long = "config_file")]
    config_file: Option<PathBuf>,
    /// Directory for logging
    #[arg(short = 'l', long = "log_dir")]
    log_dir: Option<PathBuf>,
    /// Log the running status to stderr
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn run(args: &Args) -> Result<()> {
    let (cache_url, server_id, log_dir) = if let Some(config_file) = &args.config_file {
        let config = DumpConfig::from_file(config_file)?;
        (config.cache_url, config.server_id, config.log_dir)
    } else {
        (
            args.cache_url
                .clone()
                .ok_or_else(|| CdcError::Config("--cache_url or --config_file required".into()))?,
            args.server_id
                .ok_or_else(|| CdcError::Config("--server_id or --config_file required".into()))?,
            args.log_dir.clone(),
        )
    };
    logging::init_tool(log_dir.as_deref(), "load.log", args.verbose)?;
    let mut cache = Rcache::from_url(&cache_url, server_id)?;
    load_csv(&mut cache, &args.csv_file, &args.primary_key)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("{}", err);
        eprintln!("loadcsv: {}", err);
        exit(err.exit_code());
    }
}
