use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;

use mysql_cdc::cache::Rcache;
use mysql_cdc::config::DumpConfig;
use mysql_cdc::dump::run_dump;
use mysql_cdc::error::{CdcError, Result};
use mysql_cdc::logging;

/// Drains the staging cache into dated CSV files, optionally shipping
/// them to cloud storage.
#[derive(Parser)]
#[command(name = "dump2csv", version)]
struct Args {
    /// MySQL server id of the pipeline
    #[arg(short = 's', long = "server_id")]
    server_id: Option<u32>,
    /// Cache url like "redis://host:port/db"
    #[arg(short = 'u', long = "cache_url")]
    cache_url: Option<String>,
    /// Directory for the dump result
    #[arg(short = 'd', long = "dump_dir")]
    dump_dir: Option<PathBuf>,
    /// Max rows of one csv file
    #[arg(short = 'm', long = "max_rows", default_value_t = 1_000_000)]
    max_rows: usize,
    /// Directory for logging
    #[arg(short = 'l', long = "log_dir")]
    log_dir: Option<PathBuf>,
    /// Object store url for the dumped files
    #[arg(short = 'g', long = "gs_url")]
    gs_url: Option<String>,
    /// Config file instead of the discrete flags
    #[arg(short = 'c', long = "config_file")]
    config_file: Option<PathBuf>,
    /// Log the running status to stderr
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// Tables to dump like "testdb.testtable"; all tables when empty
    tables: Vec<String>,
}

struct Options {
    cache_url: String,
    server_id: u32,
    max_rows: usize,
    dump_dir: PathBuf,
    log_dir: Option<PathBuf>,
    gs_url: Option<String>,
}

fn options(args: &Args) -> Result<Options> {
    if let Some(config_file) = &args.config_file {
        let config = DumpConfig::from_file(config_file)?;
        return Ok(Options {
            cache_url: config.cache_url,
            server_id: config.server_id,
            max_rows: config.max_rows,
            dump_dir: config.dump_dir,
            log_dir: config.log_dir,
            gs_url: config.gs_url,
        });
    }
    Ok(Options {
        cache_url: args
            .cache_url
            .clone()
            .ok_or_else(|| CdcError::Config("--cache_url or --config_file required".into()))?,
        server_id: args
            .server_id
            .ok_or_else(|| CdcError::Config("--server_id or --config_file required".into()))?,
        max_rows: args.max_rows,
        dump_dir: args
            .dump_dir
            .clone()
            .ok_or_else(|| CdcError::Config("--dump_dir or --config_file required".into()))?,
        log_dir: args.log_dir.clone(),
        gs_url: args.gs_url.clone(),
    })
}

fn run(args: &Args) -> Result<()> {
    let options = options(args)?;
    logging::init_tool(options.log_dir.as_deref(), "dump.log", args.verbose)?;
    let mut cache = Rcache::from_url(&options.cache_url, options.server_id)?;
    run_dump(
        &mut cache,
        &options.dump_dir,
        options.max_rows,
        &args.tables,
        options.gs_url.as_deref(),
        options.server_id,
    )
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("{}", err);
        eprintln!("dump2csv: {}", err);
        exit(err.exit_code());
    }
}
