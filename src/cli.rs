use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::utils::version;

#[derive(Parser)]
#[command(author, version = version(), about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_value_name = "SUBCOMMAND")]
#[command(subcommand_help_heading = "Subcommands")]
pub struct Cli {
    /// Path to config file (default: `$XDG_CONFIG_HOME/tvsync/config.kdl`).
    ///
    /// This can also be set with the `TVSYNC_CONFIG` environment variable. If both are set, the
    /// command line argument takes precedence.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// How long to run the headless simulation, in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration: u64,

    /// Synthetic clients to put on every output.
    #[arg(long, default_value_t = 2)]
    pub clients: u32,

    /// Time a synthetic client takes to draw after a frame callback, in milliseconds.
    #[arg(long, default_value_t = 4)]
    pub client_render_ms: u64,

    /// Time a synthetic client takes to resize after an output geometry change, in
    /// milliseconds.
    #[arg(long, default_value_t = 50)]
    pub client_resize_ms: u64,

    /// Rotate every output by 90 degrees this often, in seconds.
    #[arg(long)]
    pub rotate_every: Option<u64>,

    /// Report pacing statistics as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub subcommand: Option<Sub>,
}

#[derive(Subcommand)]
pub enum Sub {
    /// Validate the config file.
    Validate {
        /// Path to config file (default: `$XDG_CONFIG_HOME/tvsync/config.kdl`).
        ///
        /// This can also be set with the `TVSYNC_CONFIG` environment variable. If both are set,
        /// the command line argument takes precedence.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
