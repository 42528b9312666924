//! Command-line front end for the slotkv store.
//!
//! Each invocation opens the store, runs one command and closes it again,
//! so a crashed invocation is recovered by the next one.
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use slotkv_cli::{Cli, run};
//!
//! let cli = Cli::parse_from(["slotkv", "--dir", "/tmp/db", "put", "greeting", "hello"]);
//! run(cli, &mut std::io::stdout()).expect("put failed");
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotkv_storage::{Db, StorageConfig};
use std::io::Write;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "slotkv",
    about = "Embedded key-value store with a paged hash index",
    version
)]
pub struct Cli {
    /// Database directory
    #[arg(long, env = "SLOTKV_DIR", default_value = "./data")]
    pub dir: PathBuf,

    /// JSON configuration file; command-line flags take precedence
    #[arg(long, env = "SLOTKV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Flush the log after every write
    #[arg(long, env = "SLOTKV_SYNC")]
    pub sync: bool,

    /// Segment size at which a new segment file is started
    #[arg(long, env = "SLOTKV_MAX_SEGMENT_SIZE")]
    pub max_segment_size: Option<u32>,

    /// Emit logs as JSON
    #[arg(long, env = "SLOTKV_LOG_JSON")]
    pub log_json: bool,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Store operations.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Store a value under a key
    Put {
        /// Key to write
        key: String,
        /// Value to store
        value: String,
    },
    /// Print the value stored under a key
    Get {
        /// Key to look up
        key: String,
    },
    /// Remove a key
    Delete {
        /// Key to remove
        key: String,
    },
    /// Rebuild the index from the log
    Recover,
    /// Print store statistics
    Stats,
}

impl Cli {
    /// Build the storage configuration from the config file and flags.
    pub fn storage_config(&self) -> Result<StorageConfig> {
        let mut config = match &self.config {
            Some(path) => StorageConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => StorageConfig::default(),
        };
        config = config.with_path(&self.dir);
        if self.sync {
            config = config.with_sync_writes(true);
        }
        if let Some(size) = self.max_segment_size {
            config = config.with_max_segment_size(size);
        }
        Ok(config)
    }
}

/// Run one command, writing its output to `out`.
pub fn run<W: Write>(cli: Cli, out: &mut W) -> Result<()> {
    let config = cli.storage_config()?;
    let mut db = Db::open(config)
        .with_context(|| format!("failed to open store at {}", cli.dir.display()))?;

    let result = execute(&mut db, &cli.command, out);
    db.close().context("failed to close store")?;
    result
}

fn execute<W: Write>(db: &mut Db, command: &Command, out: &mut W) -> Result<()> {
    match command {
        Command::Put { key, value } => {
            db.put(key.as_bytes(), value.as_bytes())
                .with_context(|| format!("failed to put {key:?}"))?;
            writeln!(out, "OK")?;
        }
        Command::Get { key } => match db.get(key.as_bytes())? {
            Some(value) => writeln!(out, "{}", String::from_utf8_lossy(&value))?,
            None => anyhow::bail!("key not found: {key:?}"),
        },
        Command::Delete { key } => {
            if db.delete(key.as_bytes())? {
                writeln!(out, "deleted")?;
            } else {
                writeln!(out, "not found")?;
            }
        }
        Command::Recover => {
            let report = db.recover()?;
            writeln!(
                out,
                "replayed {} records ({} puts, {} deletes)",
                report.records, report.puts, report.deletes
            )?;
            for event in &report.truncated {
                writeln!(
                    out,
                    "truncated {} at offset {}: {} bytes discarded",
                    event.file_name, event.offset, event.discarded
                )?;
            }
        }
        Command::Stats => {
            let stats = db.stats();
            writeln!(out, "keys:            {}", stats.keys)?;
            writeln!(out, "segments:        {}", stats.segments)?;
            writeln!(out, "log bytes:       {}", stats.log_bytes)?;
            writeln!(out, "records:         {}", stats.total_records)?;
            writeln!(out, "deleted records: {}", stats.deleted_records)?;
            writeln!(out, "deleted bytes:   {}", stats.deleted_bytes)?;
            writeln!(out, "index buckets:   {}", stats.index_buckets)?;
            writeln!(out, "overflow pages:  {}", stats.overflow_pages)?;
        }
    }
    Ok(())
}
