use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::error::Result;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Producer logging: stderr, level from the config record
/// (`RUST_LOG` overrides it).
pub fn init_stderr(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .init();
}

/// Tool logging: stderr when verbose, otherwise append to
/// `<log_dir>/<file_name>` (current directory without a log dir).
pub fn init_tool(log_dir: Option<&Path>, file_name: &str, verbose: bool) -> Result<()> {
    if verbose {
        init_stderr("debug");
        return Ok(());
    }
    let path = match log_dir {
        Some(dir) => dir.join(file_name),
        None => file_name.into(),
    };
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
