// CLI module - argument parsing and config subcommand handlers

use clap::{Parser, Subcommand};
use frameflow::config::{Config, VERSION};

/// Frame orchestrator: routes ingest frame events to capability-matched
/// processors over consumer-group streams
#[derive(Parser)]
#[command(name = "frameflow")]
#[command(version = VERSION)]
#[command(about = "Frame-metadata orchestrator", long_about = None)]
pub struct Cli {
    /// Run against an in-memory backend with synthetic cameras and
    /// processors (no broker required)
    #[arg(long)]
    pub demo: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,

        /// Show the config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle a subcommand. Returns true if one was handled (exit after).
pub fn handle_command(command: &Commands) -> bool {
    match command {
        Commands::Config { show, path } => {
            if *path {
                match Config::config_path() {
                    Some(p) => println!("{}", p.display()),
                    None => println!("(no home directory; config file disabled)"),
                }
            } else if *show {
                match Config::from_env() {
                    Ok(config) => println!("{config:#?}"),
                    Err(e) => {
                        eprintln!("config error: {e}");
                        std::process::exit(1);
                    }
                }
            } else {
                println!("Usage: frameflow config [--show|--path]");
            }
            true
        }
    }
}
