//! Pairpad - collaborative code-editing sessions with sandboxed execution.
//!
//! Usage:
//!   pairpad serve [--port 8080]          # Start HTTP/WebSocket server
//!   pairpad run <language> <code>        # One-shot sandboxed run

use std::time::Duration;

use clap::{Parser, Subcommand};

use pairpad::http_server;
use pairpad::reaper::Reaper;
use pairpad::sandbox;
use pairpad::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "pairpad")]
#[command(about = "Collaborative code-editing sessions with sandboxed execution")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Seconds a connection-less session may stay idle before retirement
        #[arg(long, default_value = "900")]
        idle_timeout: u64,

        /// Seconds between idle sweeps
        #[arg(long, default_value = "60")]
        sweep_interval: u64,

        /// Wall-clock limit in seconds for a single run
        #[arg(long, default_value = "10")]
        run_timeout: u64,
    },
    /// Run one snippet through the sandbox and print its output
    Run {
        /// Language identifier (e.g. python, javascript)
        language: String,

        /// Code to evaluate as a single inline program
        code: String,

        /// Wall-clock limit in seconds
        #[arg(long, default_value = "10")]
        run_timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            idle_timeout,
            sweep_interval,
            run_timeout,
        } => {
            let state = AppState::new(Duration::from_secs(run_timeout));
            let reaper = Reaper::spawn(
                state.registry.clone(),
                Duration::from_secs(sweep_interval),
                Duration::from_secs(idle_timeout),
            );
            http_server::run_server(port, state).await;
            reaper.shutdown().await;
        }
        Commands::Run {
            language,
            code,
            run_timeout,
        } => {
            let result = sandbox::execute(&language, &code, Duration::from_secs(run_timeout)).await;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            std::process::exit(if result.stderr.is_empty() { 0 } else { 1 });
        }
    }
}
