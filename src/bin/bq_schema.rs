use std::path::PathBuf;
use std::process::exit;

use clap::{ArgAction, Parser};
use tracing::error;

use mysql_cdc::error::Result;
use mysql_cdc::logging;
use mysql_cdc::mysql::{MysqlConnector, MysqlSettings};
use mysql_cdc::schema::generate;

/// Emits one warehouse schema JSON per table from
/// `information_schema.columns`.
#[derive(Parser)]
#[command(name = "bq-schema", version, disable_help_flag = true)]
struct Args {
    /// MySQL server host
    #[arg(short = 'h', long = "host", default_value = "localhost")]
    host: String,
    /// Connection user
    #[arg(short = 'u', long = "user")]
    user: String,
    /// Connection password
    #[arg(short = 'p', long = "password")]
    password: String,
    /// MySQL server port
    #[arg(short = 'P', long = "port", default_value_t = 3306)]
    port: u16,
    /// MySQL server id of the pipeline
    #[arg(short = 's', long = "server_id")]
    server_id: u32,
    /// App system the schemas belong to, e.g. VTWeb
    #[arg(short = 'S', long = "system")]
    system: String,
    /// Output base directory
    #[arg(long = "schema_dir", default_value = "bq_schema")]
    schema_dir: PathBuf,
    /// The mysql database
    database: String,
    /// Tables to translate; all of them when empty
    tables: Vec<String>,
    #[arg(long = "help", action = ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

fn run(args: &Args) -> Result<()> {
    logging::init_stderr("info");
    let mut connector = MysqlConnector::new(MysqlSettings {
        host: args.host.clone(),
        port: args.port,
        user: args.user.clone(),
        password: args.password.clone(),
        charset: "utf8".to_string(),
    });
    connector.connect()?;
    generate(
        &mut connector,
        &args.database,
        &args.tables,
        &args.schema_dir,
        &args.system,
        args.server_id,
    )
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("{}", err);
        eprintln!("bq-schema: {}", err);
        exit(err.exit_code());
    }
}
