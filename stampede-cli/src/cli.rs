//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stampede", author, version, about = "Distributed load test orchestration", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a full run across the agents of an inventory
    Coordinator {
        /// Path to the YAML host inventory
        #[arg(long, value_name = "PATH")]
        inventory: PathBuf,

        /// Suite to run, looked up in the worker catalog
        #[arg(long, value_name = "NAME")]
        suite: String,

        /// Member workers to provision across the cluster
        #[arg(long, value_name = "N", default_value = "2")]
        members: u32,

        /// Client workers to provision across the cluster
        #[arg(long, value_name = "N", default_value = "0")]
        clients: u32,

        /// RUN phase wall-clock budget in seconds
        #[arg(long, value_name = "SECS", conflicts_with = "iterations")]
        duration: Option<u64>,

        /// RUN phase iteration budget per worker
        #[arg(long, value_name = "COUNT")]
        iterations: Option<u64>,

        /// Concurrent RUN tasks per worker; 0 means one per core
        #[arg(long, value_name = "N", default_value = "1")]
        run_threads: usize,

        /// Test parameter handed to the suite hooks, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Serve as an agent, supervising workers for a coordinator
    Agent {
        /// Port to listen on, overriding the configuration
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Run as a worker process (internal use)
    #[command(hide = true)]
    Worker {
        /// Hierarchical address assigned by the supervising agent
        #[arg(long, value_name = "ADDRESS")]
        address: String,
    },

    /// Run a suite on an in-process cluster
    Local {
        /// Suite to run
        #[arg(long, value_name = "NAME", default_value = "demo")]
        suite: String,

        /// In-process agents to bring up
        #[arg(long, value_name = "N", default_value = "2")]
        agents: u32,

        /// Member workers across the cluster
        #[arg(long, value_name = "N", default_value = "2")]
        members: u32,

        /// Client workers across the cluster
        #[arg(long, value_name = "N", default_value = "0")]
        clients: u32,

        /// RUN phase wall-clock budget in seconds
        #[arg(long, value_name = "SECS", conflicts_with = "iterations")]
        duration: Option<u64>,

        /// RUN phase iteration budget per worker
        #[arg(long, value_name = "COUNT")]
        iterations: Option<u64>,

        /// Concurrent RUN tasks per worker; 0 means one per core
        #[arg(long, value_name = "N", default_value = "1")]
        run_threads: usize,

        /// Test parameter handed to the suite hooks, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Generate a sample configuration file
    Generate {
        /// Output file path; prints to stdout when absent
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_parsing() {
        assert_eq!(
            parse_key_value("rate=100"),
            Ok(("rate".to_string(), "100".to_string()))
        );
        assert_eq!(
            parse_key_value("url=http://x/?a=b"),
            Ok(("url".to_string(), "http://x/?a=b".to_string()))
        );
        assert!(parse_key_value("no-separator").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn test_cli_parses_a_coordinator_invocation() {
        let cli = Cli::parse_from([
            "stampede",
            "coordinator",
            "--inventory",
            "hosts.yaml",
            "--suite",
            "demo",
            "--members",
            "4",
            "--duration",
            "60",
            "--param",
            "spin_micros=200",
        ]);
        match cli.command {
            Commands::Coordinator {
                suite,
                members,
                duration,
                params,
                ..
            } => {
                assert_eq!(suite, "demo");
                assert_eq!(members, 4);
                assert_eq!(duration, Some(60));
                assert_eq!(params, vec![("spin_micros".to_string(), "200".to_string())]);
            }
            _ => panic!("expected the coordinator subcommand"),
        }
    }
}
