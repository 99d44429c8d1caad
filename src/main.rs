//! sandbox-session - compile and run untrusted C/C++ over a WebSocket.
//!
//! Usage:
//!   sandbox-session serve [--port 8080]     # Start the server
//!   sandbox-session check <file>            # Screen a source file

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use tracing_subscriber::EnvFilter;

use sandbox_session::config::ServeArgs;
use sandbox_session::http_server;
use sandbox_session::validator::{self, ValidationLimits};

#[derive(Parser, Debug)]
#[command(name = "sandbox-session")]
#[command(about = "Sandboxed compile/run/debug sessions over a WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),

    /// Run the source validator over a file
    Check {
        /// Source file to screen
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            if let Err(e) = http_server::run_server(args.into_config()).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Check { file } => {
            let source = match std::fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("Error: {}: {}", file.display(), e);
                    exit(1);
                }
            };
            match validator::validate(&source, &ValidationLimits::default()) {
                Ok(()) => println!("{}: accepted", file.display()),
                Err(rejection) => {
                    println!("{}: rejected: {}", file.display(), rejection);
                    exit(1);
                }
            }
        }
    }
}
