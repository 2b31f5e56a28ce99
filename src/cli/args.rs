/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli::lp;

#[derive(Debug, Subcommand)]
pub enum Command {
    Info(lp::InfoCli),
    Create(lp::CreateCli),
    Add(lp::AddCli),
    Remove(lp::RemoveCli),
    Resize(lp::ResizeCli),
    ResizeGroup(lp::ResizeGroupCli),
    Compact(lp::CompactCli),
    Detect(lp::DetectCli),
}

/// Inspect and edit the logical partition metadata of Android super images.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lower the log message severity threshold.
    #[arg(short, long, global = true)]
    pub debug: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Info(c) => lp::info_subcommand(&c),
        Command::Create(c) => lp::create_subcommand(&c),
        Command::Add(c) => lp::add_subcommand(&c),
        Command::Remove(c) => lp::remove_subcommand(&c),
        Command::Resize(c) => lp::resize_subcommand(&c),
        Command::ResizeGroup(c) => lp::resize_group_subcommand(&c),
        Command::Compact(c) => lp::compact_subcommand(&c),
        Command::Detect(c) => lp::detect_subcommand(&c),
    }
}
