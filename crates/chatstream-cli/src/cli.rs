//! Command-line surface of the `chatstream` binary.
//!
//! Deliberately thin: two subcommands (`serve`, `config`), each taking the
//! config file path plus a couple of flag overrides that win over whatever
//! the TOML resolves.  Anything with real behavior lives behind the
//! `cmd_*` functions the dispatcher in `main.rs` calls.

use clap::{Parser, Subcommand};

/// chatstream -- streaming event pipeline for conversational AI backends.
#[derive(Parser)]
#[command(
    name = "chatstream",
    version,
    about = "chatstream -- streaming event pipeline server",
    long_about = "Converts an agent's event stream into live WebSocket notifications \
                  and durable conversation messages."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server.
    Serve {
        /// Address to bind the HTTP server to (overrides config).
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (overrides config).
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to the configuration file.
        #[arg(long, default_value = "config/default.toml")]
        config: String,
    },

    /// Print the resolved configuration and exit.
    Config {
        /// Path to the configuration file.
        #[arg(long, default_value = "config/default.toml")]
        config: String,
    },
}
