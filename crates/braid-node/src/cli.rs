//! CLI arguments for the braid node

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Braid mesh node - multi-hop TCP tunneling router
#[derive(Parser, Debug)]
#[command(name = "braid-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "braid.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (default)
    Run,

    /// Print a sample configuration file
    GenerateConfig,

    /// Measure round-trip latency over a path (appends the echo hop)
    Ping {
        /// Path to ping through, e.g. "master" or "master->slaver"
        path: String,

        /// Number of rounds; 0 pings forever
        #[arg(long, default_value_t = 5)]
        count: u64,

        /// Delay between rounds in milliseconds
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },

    /// Run a command with its TCP egress proxied through the mesh
    Exec {
        /// Command and arguments to run
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Run an SSH client whose connection is tunneled through the mesh
    ExecSsh {
        /// Path to the SSH host; `tcp://127.0.0.1:22` is appended when the
        /// path has no terminal hop
        uri: String,

        /// Mesh path to an HTTP service returning the private key for `uri`
        #[arg(long)]
        key_path: Option<String>,

        /// Client to exec; `bshost` in arguments becomes the host alias
        #[arg(long, default_value = "ssh")]
        command: String,

        /// ProxyCommand template; `${PROXY}` is the loopback SOCKS5 address
        #[arg(long, default_value = "nc -X 5 -x ${PROXY} %h %p")]
        proxy_command: String,

        /// Extra arguments passed to the client
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Fetch and pretty-print the state endpoint of a running node
    State,
}
