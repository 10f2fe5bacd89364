//! SOCKS5 relay binary
//!
//! Usage: socks5-relay [OPTIONS]
//!
//! Options:
//!   -p <port>    TCP listen port
//!   -d <Y|y>     Run detached
//!   -l <0-5>     Log level
//!   -h           Print help information

use std::env;

use socks5_relay::cli::{self, CliOptions};
use socks5_relay::server::{shutdown, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let options = match CliOptions::parse(env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("check argument error.");
            std::process::exit(1);
        }
    };

    for diagnostic in &options.diagnostics {
        println!("{}", diagnostic);
    }

    if options.help {
        print!("{}", cli::usage());
        return Ok(());
    }

    // -l wins over RUST_LOG (e.g. RUST_LOG=debug)
    let filter = match options.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(cli::log_filter(level)),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if options.detach {
        tracing::warn!("Detaching is not supported; staying in the foreground");
    }

    let config = options.to_config();
    tracing::info!("socks5 starting at {}", config.start_time);

    let server = Server::bind(config)?;
    let ctx = server.context();
    let stop = server.shutdown_handle();

    tokio::spawn(async move {
        match shutdown::wait_for_signal().await {
            Ok(()) => {
                tracing::info!("Termination signal received");
                stop.trigger();
            }
            Err(e) => tracing::warn!("Signal handler unavailable: {}", e),
        }
    });

    server.run().await?;

    tracing::info!("\n{}", ctx.metrics.format_report());
    tracing::info!("exit socket server.");
    Ok(())
}
