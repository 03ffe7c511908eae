//! StackMemory MCP Server
//!
//! Exposes the memory engine over the Model Context Protocol on stdio:
//! frame lifecycle, anchors, token-budgeted context retrieval, and the
//! companion task store. Optionally runs the daemon (filesystem watcher,
//! tier migration loop, session sweeper, lifecycle hooks) in-process.

mod protocol;
mod server;
mod tools;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stackmemory_core::{Daemon, MemoryEngine};

use crate::protocol::stdio::StdioTransport;
use crate::server::McpServer;

/// Parsed command line
struct Args {
    project_root: Option<PathBuf>,
    with_daemon: bool,
}

/// Parse arguments by hand; exits for `--help` / `--version`.
fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        project_root: None,
        with_daemon: false,
    };
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "--help" | "-h" => {
                println!("StackMemory MCP Server v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Durable working memory for AI coding assistants over MCP.");
                println!();
                println!("USAGE:");
                println!("    stackmemory-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --project <PATH>        Project root (default: current directory)");
                println!("    --with-daemon           Run the watcher/migration daemon in-process");
                println!();
                println!("ENVIRONMENT:");
                println!("    STACKMEMORY_PROJECT     Override the project root directory");
                println!("    STACKMEMORY_SESSION     Pin to an explicit session id");
                println!("    LOG_LEVEL               debug, info, warn, or error");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("stackmemory-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--project" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("error: --project requires a path argument");
                    std::process::exit(1);
                }
                args.project_root = Some(PathBuf::from(&argv[i]));
            }
            arg if arg.starts_with("--project=") => {
                let path = arg.strip_prefix("--project=").unwrap_or("");
                if path.is_empty() {
                    eprintln!("error: --project requires a path argument");
                    std::process::exit(1);
                }
                args.project_root = Some(PathBuf::from(path));
            }
            "--with-daemon" => {
                args.with_daemon = true;
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Try 'stackmemory-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    // Logging goes to stderr; stdout belongs to JSON-RPC.
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("StackMemory MCP Server v{} starting", env!("CARGO_PKG_VERSION"));

    let engine = match MemoryEngine::init(args.project_root) {
        Ok(engine) => {
            info!(
                project_id = %engine.project_id(),
                session_id = %engine.session_id(),
                "engine ready"
            );
            Arc::new(engine)
        }
        Err(e) => {
            error!("failed to initialize engine: {}", e);
            std::process::exit(1);
        }
    };

    // The daemon is optional for the MCP surface; without it, frames still
    // work but tier migration waits for a daemon-owning process.
    let daemon = if args.with_daemon {
        match Daemon::start(Arc::clone(&engine), None) {
            Ok(daemon) => Some(daemon),
            Err(e) => {
                warn!("daemon unavailable ({}); continuing without background migration", e);
                None
            }
        }
    } else {
        None
    };

    let server = McpServer::new(Arc::clone(&engine));
    let transport = StdioTransport::new();

    info!("serving MCP on stdio");
    if let Err(e) = transport.run(server).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    if let Some(daemon) = daemon {
        daemon.stop().await;
    }
    info!("StackMemory MCP Server shutting down");
}
