// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Result;
use clap::{Parser, Subcommand};
use scriptbox_cli::{describe_resolution, list_snapshot, load_snapshot, pack_host_dir, write_snapshot};
use scriptbox_logging::CliLoggingArgs;
use scriptbox_modules::LoaderConfig;
use scriptbox_vfs::VirtualFs;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Pack virtual filesystem snapshots and inspect module resolution")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot packing and inspection
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Resolve a specifier inside a snapshot without executing anything
    Resolve {
        /// Snapshot file to resolve against
        snapshot: PathBuf,
        /// Module specifier, e.g. ./util or lodash
        specifier: String,
        /// Path of the requesting module inside the snapshot
        #[arg(long = "from", default_value = "/index.js")]
        parent: String,
        /// Loader configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Treat NAME as a registered built-in (repeatable)
        #[arg(long = "builtin", value_name = "NAME")]
        builtins: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Copy a host directory into a snapshot file
    Pack {
        /// Host directory to copy
        source: PathBuf,
        /// Output snapshot file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print every node in a snapshot (kind, mode, size, path)
    List {
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("scriptbox-cli")?;

    match cli.command {
        Command::Snapshot(SnapshotCommand::Pack { source, output }) => {
            let vfs = VirtualFs::default();
            let stats = pack_host_dir(&source, &vfs)?;
            let written = write_snapshot(&vfs, &output)?;
            println!(
                "PACKED\tfiles={}\tdirs={}\tsymlinks={}\tbytes={written}",
                stats.files, stats.directories, stats.symlinks
            );
        }
        Command::Snapshot(SnapshotCommand::List { snapshot }) => {
            let bytes = std::fs::read(&snapshot)?;
            for line in list_snapshot(&bytes)? {
                println!("{line}");
            }
        }
        Command::Resolve {
            snapshot,
            specifier,
            parent,
            config,
            builtins,
        } => {
            let config = match config {
                Some(path) => LoaderConfig::from_file(&path)?,
                None => LoaderConfig::default(),
            };
            let vfs = load_snapshot(&snapshot)?;
            let builtins: BTreeSet<String> = builtins.into_iter().collect();
            println!("{}", describe_resolution(&vfs, &specifier, &parent, &builtins, &config)?);
        }
    }
    Ok(())
}
