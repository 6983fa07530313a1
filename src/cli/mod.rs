//! `arcstore` command-line inspector.

pub mod output;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

use crate::config::{StoreConfig, open_store};
use crate::storage::{ObjectStorage, Tags};
use output::{print_line, write_raw};

/// Inspect and edit archive-backed object stores
#[derive(Debug, Parser)]
#[command(name = "arcstore", version, about)]
pub struct Cli {
    /// JSON store configuration file
    #[arg(short, long, value_name = "FILE", conflicts_with = "target")]
    pub config: Option<PathBuf>,

    /// Directory, archive file, or http(s) URL of an archive
    #[arg(value_name = "TARGET")]
    pub target: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List objects and sub-directories under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
        /// Show sizes and modification times
        #[arg(short, long)]
        long: bool,
    },
    /// Write an object's content to stdout
    Cat { key: String },
    /// Store a file (or stdin) under a key
    Put {
        key: String,
        /// Read from stdin when omitted
        file: Option<PathBuf>,
    },
    /// Delete an object
    Rm { key: String },
    /// Show whether an object exists and its size
    Stat { key: String },
}

impl Cli {
    fn store_config(&self) -> Result<StoreConfig> {
        match (&self.config, &self.target) {
            (Some(path), _) => StoreConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            (None, Some(target)) => Ok(StoreConfig::from_target(target)),
            (None, None) => Err(anyhow!("Either --config FILE or TARGET is required")),
        }
    }
}

/// Open the configured store, run one command, and close the store
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.store_config()?;
    let store = open_store(&config).await?;

    let result = execute(store.as_ref(), cli.command).await;
    store.close().await?;
    result
}

async fn execute(store: &dyn ObjectStorage, command: Command) -> Result<()> {
    match command {
        Command::Ls { prefix, long } => ls(store, &prefix, long).await,
        Command::Cat { key } => {
            let bytes = store.download_bytes(&key).await?;
            write_raw(&bytes)?;
            Ok(())
        }
        Command::Put { key, file } => {
            let data = match file {
                Some(path) => Bytes::from(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut buf)
                        .await
                        .context("Failed to read stdin")?;
                    Bytes::from(buf)
                }
            };
            let size = data.len() as u64;
            store.upload(&key, data, Tags::new()).await?;
            eprintln!(
                "{} {} ({})",
                "Stored".green().bold(),
                key,
                humansize::format_size(size, humansize::BINARY)
            );
            Ok(())
        }
        Command::Rm { key } => {
            store.delete(&key).await?;
            eprintln!("{} {}", "Deleted".green().bold(), key);
            Ok(())
        }
        Command::Stat { key } => stat(store, &key).await,
    }
}

async fn ls(store: &dyn ObjectStorage, prefix: &str, long: bool) -> Result<()> {
    let (objects, prefixes) = store.list(prefix).await?.collect().await?;

    if long {
        print_line!("{:<50} {:>12} MODIFIED", "NAME", "SIZE");
        print_line!("{}", "-".repeat(80));
    }

    for common in &prefixes {
        if long {
            print_line!("{:<50} {:>12} -", common.key.blue().bold(), "-");
        } else {
            print_line!("{}", common.key.blue().bold());
        }
    }

    for object in &objects {
        if long {
            let modified = object
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            print_line!(
                "{:<50} {:>12} {}",
                object.key,
                humansize::format_size(object.size, humansize::BINARY),
                modified
            );
        } else {
            print_line!("{}", object.key);
        }
    }

    Ok(())
}

async fn stat(store: &dyn ObjectStorage, key: &str) -> Result<()> {
    if !store.exists(key).await? {
        return Err(anyhow!("No such object: {key}"));
    }

    // Listing with the key itself as prefix reports it as an object
    let (objects, _) = store.list(key).await?.collect().await?;
    let object = objects.into_iter().find(|o| o.key == key);

    print_line!("{:<10} {}", "key:".bold(), key);
    print_line!("{:<10} {}", "backend:".bold(), store.backend_name());
    match object {
        Some(object) => {
            print_line!(
                "{:<10} {} ({} bytes)",
                "size:".bold(),
                humansize::format_size(object.size, humansize::BINARY),
                object.size
            );
            if let Some(modified) = object.last_modified {
                print_line!("{:<10} {}", "modified:".bold(), modified.to_rfc3339());
            }
        }
        None => print_line!("{:<10} directory", "type:".bold()),
    }

    Ok(())
}
