use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
    /// Set a custom config file
    #[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
    pub config: Option<String>,

    /// Set configuration directory
    #[arg(short = 'C', visible_short_alias = 'd', long, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,

    /// Show current version
    #[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a new default configuration file and exit
    Init {
        /// Where to write the generated config
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Specify the configuration file format (yaml or toml)
        #[arg(short, long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}
