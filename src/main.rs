//! CLI for msgbroker
//!
//! Subcommands:
//! - `serve`: run the broker with both transports (the default)
//! - `publish`: send one `PUB` request to a running server
//! - `subscribe`: subscribe to a topic and print deliveries until interrupted

use clap::{Parser, Subcommand};
use msgbroker::broker::BrokerService;
use msgbroker::client::StreamClient;
use msgbroker::config::{Settings, load_config};
use msgbroker::transport::{DatagramServer, StreamServer};
use msgbroker::utils::logging;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "msgbroker", about = "In-memory publish/subscribe broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the stream and datagram servers
    Serve {
        /// Port for the stream transport (overrides the configuration)
        #[arg(long)]
        stream_port: Option<u16>,
        /// Port for the datagram transport (overrides the configuration)
        #[arg(long)]
        datagram_port: Option<u16>,
        /// Log level: error, warn, info, debug or trace
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Publish one message and print the acknowledgement
    Publish {
        topic: String,
        message: String,
        /// Stream server address
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
    /// Subscribe to a topic and print every delivery
    Subscribe {
        topic: String,
        /// Stream server address
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Command::Serve {
        stream_port: None,
        datagram_port: None,
        log_level: None,
    });

    let result = match command {
        Command::Serve {
            stream_port,
            datagram_port,
            log_level,
        } => run_server(stream_port, datagram_port, log_level).await,
        Command::Publish {
            topic,
            message,
            addr,
        } => run_publish(&addr, &topic, &message).await,
        Command::Subscribe { topic, addr } => run_subscribe(&addr, &topic).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("msgbroker: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(
    stream_port: Option<u16>,
    datagram_port: Option<u16>,
    log_level: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config: Settings = load_config()?;
    if let Some(port) = stream_port {
        config.stream.port = port;
    }
    if let Some(port) = datagram_port {
        config.datagram.port = port;
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }

    let log_sink = logging::init(&config.logging.level, config.logging.queue_capacity);
    let broker = BrokerService::start(&config.broker);

    let result = serve(&config, &broker).await;
    if let Err(e) = &result {
        error!("Server failed: {}", e);
    }

    broker.stop().await;
    info!("shutdown complete");

    let dropped = log_sink.stop();
    if dropped > 0 {
        eprintln!("msgbroker: {dropped} log lines dropped");
    }
    result
}

/// Runs both transports until an interrupt, a termination signal or a `STOP`
/// datagram, then stops them in order.
async fn serve(config: &Settings, broker: &BrokerService) -> Result<(), Box<dyn std::error::Error>> {
    let stream = StreamServer::start(&config.stream, broker.handle()).await?;
    let datagram = match DatagramServer::start(&config.datagram, broker.handle()).await {
        Ok(datagram) => datagram,
        Err(e) => {
            stream.stop().await;
            return Err(e.into());
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
        _ = terminated() => {
            info!("Termination signal received. Exiting gracefully.");
        }
        _ = datagram.stopped() => {
            info!("Datagram server exited, shutting down.");
        }
    }

    stream.stop().await;
    datagram.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            error!("could not listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    std::future::pending::<()>().await;
}

async fn run_publish(addr: &str, topic: &str, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StreamClient::connect(addr).await?;
    let ack = client.publish(topic, message).await?;
    println!("{ack}");
    client.shutdown().await?;
    Ok(())
}

async fn run_subscribe(addr: &str, topic: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StreamClient::connect(addr).await?;
    let ack = client.subscribe(topic).await?;
    println!("{ack}");

    loop {
        tokio::select! {
            line = client.next_line() => match line? {
                Some(line) => println!("{line}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
