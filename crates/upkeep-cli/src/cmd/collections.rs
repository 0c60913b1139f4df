use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use upkeep_core::{
    collections::{CollectionRecord, CollectionStore},
    config::Config,
    paths,
};

#[derive(Subcommand)]
pub enum CollectionsSubcommand {
    /// List collections, newest first
    List {
        /// Application database (default: database.path from config)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

pub fn run(root: &Path, subcmd: CollectionsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        CollectionsSubcommand::List { db } => list(root, db, json),
    }
}

fn list(root: &Path, db: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let db = match db {
        Some(p) => paths::resolve(root, &p),
        None => {
            let config = Config::load(root).context("failed to load config")?;
            let db = config.database.unwrap_or_default();
            paths::resolve(root, &db.path)
        }
    };

    let records: Vec<CollectionRecord> = if db.exists() {
        CollectionStore::open_read_only(&db)
            .and_then(|store| store.list())
            .with_context(|| format!("failed to read collections from {}", db.display()))?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No collections.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|c| {
            vec![
                c.id.to_string(),
                c.name.clone(),
                or_dash(c.start_s.map(|s| format!("{s:.1}"))),
                or_dash(c.end_s.map(|s| format!("{s:.1}"))),
                if c.uploaded { "yes" } else { "no" }.to_string(),
                or_dash(c.description.as_deref()),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "START", "END", "UPLOADED", "DESCRIPTION"], &rows);
    Ok(())
}
