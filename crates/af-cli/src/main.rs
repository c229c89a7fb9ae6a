mod commands;

use std::path::PathBuf;

use af_core::types::AgentRole;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// auto-foreman -- keep a designer and an implementer busy on a markdown backlog.
#[derive(Parser)]
#[command(name = "af", version, about)]
struct Cli {
    /// Config file (defaults to ~/.auto-foreman/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until SIGINT/SIGTERM.
    Start,

    /// Show daemon, worker and queue status (default when no subcommand is given).
    Status,

    /// Ask a running daemon to shut down and wait for it to exit.
    Stop {
        /// Seconds to wait before giving up.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// List the slowest recently completed tasks.
    Bottlenecks {
        /// Maximum number of tasks to show.
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },

    /// Bring a worker that was given up on back into service.
    Reset {
        /// Worker role: designer or implementer.
        role: AgentRole,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Start) => {
            let code = commands::start::run(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        None | Some(Commands::Status) => commands::status::run(&config)?,
        Some(Commands::Stop { timeout }) => commands::stop::run(&config, timeout).await?,
        Some(Commands::Bottlenecks { limit }) => commands::bottlenecks::run(&config, limit)?,
        Some(Commands::Reset { role }) => commands::reset::run(&config, role)?,
    }

    Ok(())
}
