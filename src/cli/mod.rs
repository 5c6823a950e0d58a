//! CLI Module
//!
//! Command-line driver that runs the engine against the in-memory platform
//! and prints JSON reports.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Orbitone - entity audio engine driver
#[derive(Parser, Debug)]
#[command(name = "orbitone")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Engine config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Play a short scene on the in-memory platform and report the graph
    #[command(name = "demo")]
    Demo {
        /// Seconds of transport time to run
        #[arg(short, long, default_value_t = 4.0)]
        seconds: f64,

        /// Tempo in BPM
        #[arg(short, long, default_value_t = 120.0)]
        tempo: f64,

        /// Musical key, e.g. "D" or "Bb minor"
        #[arg(short, long, default_value = "C")]
        key: String,

        /// Preset for melodic voices
        #[arg(short, long, default_value = "lead")]
        preset: String,

        /// Host identification to classify
        #[arg(long)]
        user_agent: Option<String>,

        /// Include every node, edge and event in the report
        #[arg(long)]
        full: bool,
    },

    /// List voice presets
    #[command(name = "presets")]
    Presets,

    /// Print the effective configuration
    #[command(name = "config")]
    Config,
}
