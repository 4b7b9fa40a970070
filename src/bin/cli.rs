//! PageKV CLI
//!
//! Command-line driver for a PageKV file: create trees, read and write
//! string keys, run the consistency check.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pagekv::{Config, Database, Entry, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// PageKV CLI
#[derive(Parser, Debug)]
#[command(name = "pagekv-cli")]
#[command(about = "Inspect and drive a PageKV page file")]
#[command(version)]
struct Args {
    /// Page file (created if missing)
    #[arg(short, long, default_value = "./pagekv.db")]
    file: PathBuf,

    /// Pages to create a new file with
    #[arg(long, default_value = "1024")]
    initial_pages: u32,

    /// Run the tree self-check after every write
    #[arg(long)]
    check_after_write: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or validate) the page file
    Init,

    /// Create a named tree
    CreateTree {
        /// Tree name
        name: String,

        /// Create a plain tree without snapshot isolation
        #[arg(long)]
        no_mvcc: bool,
    },

    /// Add a value to a key
    Put {
        tree: String,
        key: String,
        value: String,
    },

    /// Print all values of a key
    Get { tree: String, key: String },

    /// Remove one value from a key
    Del {
        tree: String,
        key: String,
        value: String,
    },

    /// Print every entry of a tree in key order
    Scan { tree: String },

    /// Check the directory, every tree and the page accounting
    Check,

    /// Print file and transaction statistics
    Stats,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pagekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let config = Config::builder()
        .path(&args.file)
        .initial_pages(args.initial_pages)
        .check_after_write(args.check_after_write)
        .flush_on_commit(true)
        .build();
    let db = Database::open(config)?;
    let session = db.session();

    match args.command {
        Commands::Init => {
            tracing::info!("PageKV v{} file {}", pagekv::VERSION, args.file.display());
        }
        Commands::CreateTree { name, no_mvcc } => {
            let tree = db.create_tree(&name, !no_mvcc)?;
            println!("created {} (root page {}, mvcc {})", tree.name(), tree.root(), tree.is_mvcc());
        }
        Commands::Put { tree, key, value } => {
            db.get_tree(&tree)?.insert(&session, key, value)?;
        }
        Commands::Get { tree, key } => match db.get_tree(&tree)?.find(&session, key)? {
            Some(values) => {
                for value in values {
                    println!("{}", value);
                }
            }
            None => return Ok(ExitCode::from(1)),
        },
        Commands::Del { tree, key, value } => {
            db.get_tree(&tree)?.remove(&session, key, value)?;
        }
        Commands::Scan { tree } => {
            let tree = db.get_tree(&tree)?;
            for entry in tree.iter(&session)? {
                let entry = entry?;
                let values: Vec<String> = entry.values.iter().map(Entry::to_string).collect();
                println!("{}\t{}", entry.key, values.join(", "));
            }
        }
        Commands::Check => {
            let report = db.check()?;
            if !report.is_empty() {
                print!("{}", report);
                return Ok(ExitCode::FAILURE);
            }
            println!("ok");
        }
        Commands::Stats => {
            let stats = db.stats()?;
            println!("pages:        {}", stats.page_count);
            println!("used pages:   {}", stats.used_pages);
            println!("free pages:   {}", stats.free_pages);
            println!("trees:        {}", stats.trees);
            println!("open txs:     {}", stats.mvcc.active_transactions);
            println!("pre-images:   {}", stats.mvcc.preimages);
            println!("retired:      {}", stats.mvcc.retired_pages);
        }
    }

    db.flush()?;
    Ok(ExitCode::SUCCESS)
}
