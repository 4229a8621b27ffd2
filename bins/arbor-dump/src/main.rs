use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use arbor_ledger::{Ledger, LedgerOptions};

/// Print the structure of an Arbor ledger.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the ledger database directory.
    db_path: PathBuf,

    /// Also list every block per height, branches included.
    #[arg(long)]
    blocks: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let ledger = Ledger::open(&args.db_path, LedgerOptions::default())
        .with_context(|| format!("failed to open ledger at {}", args.db_path.display()))?;

    let meta = ledger.meta();
    println!("root:   {}", meta.root_block_id);
    println!("tip:    {}", meta.tip_block_id);
    println!("height: {}", meta.trunk_height);

    let tips = ledger.branch_tips().context("failed to list branch tips")?;
    println!("tips:   {}", tips.len());
    for (id, height) in &tips {
        println!("  {id} @ {height}");
    }

    if args.blocks {
        for (height, level) in ledger.dump().context("dump failed")?.iter().enumerate() {
            println!("[{height}]");
            for line in level {
                println!("  {line}");
            }
        }
    }

    Ok(())
}
