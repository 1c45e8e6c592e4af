//! Kokia CLI - コマンドラインインターフェース
//!
//! デバッグエージェントをTCPで公開する `agent` と、
//! エージェントに接続してプロセス一覧を表示する `ps` を提供します。

mod ps;
mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kokia_agent::AgentConfig;
use kokia_agent::config::DEFAULT_MAX_BACKTRACE_FRAMES;
use tracing_subscriber::EnvFilter;

/// Kokia - Remote Process Debugger
#[derive(Parser)]
#[command(name = "kokia")]
#[command(version = "0.1.0")]
#[command(about = "Remote process debugger agent and client", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: KokiaCommand,
}

#[derive(Subcommand)]
enum KokiaCommand {
    /// Serve the debug agent on a TCP address
    Agent {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:2345")]
        listen: String,

        /// Maximum number of frames returned by a backtrace
        #[arg(long, default_value_t = DEFAULT_MAX_BACKTRACE_FRAMES)]
        max_frames: usize,
    },

    /// Connect to an agent and list its processes
    Ps {
        /// Agent address
        #[arg(short, long, default_value = "127.0.0.1:2345")]
        connect: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // ptrace はアタッチしたOSスレッドからしか操作できない
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    match cli.command {
        KokiaCommand::Agent { listen, max_frames } => {
            let config = AgentConfig { max_backtrace_frames: max_frames };
            runtime.block_on(serve::serve(&listen, config))
        }
        KokiaCommand::Ps { connect } => runtime.block_on(ps::ps(&connect)),
    }
}

/// RUST_LOG があればそれを、なければ `--log-level` を使う
fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
