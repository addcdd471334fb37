use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;

use mysql_cdc::config::CdcConfig;
use mysql_cdc::error::Result;
use mysql_cdc::logging;
use mysql_cdc::producer::Producer;

/// MySQL change data capture: tails the binlog and coalesces row
/// mutations into the staging cache.
#[derive(Parser)]
#[command(name = "cdc", version)]
struct Args {
    /// Config file (JSON)
    #[arg(short = 'c', long = "config_file", default_value = "cdc.conf")]
    config_file: PathBuf,
}

fn run(args: &Args) -> Result<()> {
    let config = CdcConfig::from_file(&args.config_file)?;
    logging::init_stderr(&config.log_level);
    Producer::new(config)?.run()
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("{}", err);
        eprintln!("cdc: {}", err);
        exit(err.exit_code());
    }
}
