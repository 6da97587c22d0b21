//! kerneld CLI entry point.
//!
//! Runs the echo kernel on either transport binding. With the physical
//! binding the connection file is read when it exists, and written with the
//! bound ports when it does not.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kernel_streams::SubstitutionMode;
use kerneld::config::{
    ConnectionInfo, KernelConfig, OverflowPolicy, QueueConfig, TransportKind,
    DEFAULT_QUEUE_CAPACITY,
};
use kerneld::echo::EchoEngine;
use kerneld::Binding;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "kerneld")]
#[command(about = "Notebook kernel with per-execution output capture")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Jupyter connection file (physical transport)
    #[arg(long, short = 'f')]
    connection_file: Option<PathBuf>,

    /// Transport binding: physical or shared
    #[arg(long, default_value_t = TransportKind::Physical)]
    transport: TransportKind,

    /// Listen address for the shared transport
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Capacity of the shell and control queues
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// What a full queue does with new messages: drop or block
    #[arg(long, default_value_t = OverflowPolicy::Drop)]
    overflow: OverflowPolicy,

    /// Stream substitution engine: blocking or non-blocking
    #[arg(long, default_value_t = SubstitutionMode::NonBlocking)]
    substitution: SubstitutionMode,

    /// Only pass output through; do not publish it as stream messages
    #[arg(long)]
    no_capture: bool,

    /// Interval of the periodic output flush, in milliseconds
    #[arg(long, default_value = "100")]
    buffer_time_limit_ms: u64,

    /// Buffered bytes that force a flush
    #[arg(long, default_value = "1000")]
    buffer_max_size: usize,

    /// Bytes captured per stream per execution before output is truncated
    #[arg(long, default_value = "100000")]
    per_execution_max_size: usize,

    /// Buffered bytes that trigger a flush once a line is complete
    #[arg(long, default_value = "100")]
    newline_buffer_size: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = kernel_config(&cli)?;
    config.validate()?;

    info!("[kerneld] Starting ({} transport)", config.transport);
    info!("[kerneld]   Queue: {} ({})", config.queue.capacity, config.queue.overflow);
    info!("[kerneld]   Substitution: {}", config.substitution);
    info!("[kerneld]   Capture: {:?}", config.capture);

    let binding = Binding::bind(&config).context("failed to bind transport")?;
    if let Some(info) = binding.connection_info() {
        publish_connection_info(info, cli.connection_file.as_deref())?;
    }
    if let Some(addr) = binding.local_addr() {
        info!("[kerneld] Shared transport listening on {addr}");
    }

    let kernel = kerneld::launch(&config, &binding, Arc::new(EchoEngine));
    kernel.broadcast_starting();
    kernel.manager().listen()?;

    info!("[kerneld] Shut down after {} executions", kernel.execution_count());
    Ok(())
}

fn kernel_config(cli: &Cli) -> anyhow::Result<KernelConfig> {
    let mut config = KernelConfig {
        transport: cli.transport,
        listen: cli.listen,
        queue: QueueConfig {
            capacity: cli.queue_capacity,
            overflow: cli.overflow,
        },
        substitution: cli.substitution,
        ..KernelConfig::default()
    };

    config.capture.capture_output = !cli.no_capture;
    config.capture.buffer_time_limit = Duration::from_millis(cli.buffer_time_limit_ms);
    config.capture.buffer_max_size = cli.buffer_max_size;
    config.capture.per_execution_max_size = cli.per_execution_max_size;
    config.capture.newline_buffer_size = cli.newline_buffer_size;

    if let Some(path) = cli.connection_file.as_deref().filter(|p| p.exists()) {
        config.connection = ConnectionInfo::from_file(path)?;
        info!("[kerneld] Using connection file {}", path.display());
    }
    Ok(config)
}

/// Write the bound connection info where the frontend expects it, or print
/// it when no path was given.
fn publish_connection_info(info: &ConnectionInfo, path: Option<&Path>) -> anyhow::Result<()> {
    match path {
        Some(path) if path.exists() => Ok(()),
        Some(path) => {
            info.write_file(path)?;
            info!("[kerneld] Wrote connection file {}", path.display());
            Ok(())
        }
        None => {
            println!("{}", serde_json::to_string_pretty(info)?);
            Ok(())
        }
    }
}
