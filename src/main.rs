//! CalcNet - Remote calculator over TCP and lossy UDP
//!
//! A client sends prefix arithmetic expressions to a server using a small
//! HTTP-like text protocol. Over UDP the server can simulate packet loss and
//! the client recovers with exponential-backoff retransmission.

mod batch;
mod calculator;
mod config;
mod network;
mod protocol;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use batch::{LineReport, LineResult};
use config::Config;
use network::{
    server, Client, DropProbability, LossSimulator, Outcome, ServerStats, TcpTransport, UdpTransport,
};

/// CalcNet - Remote calculator over TCP and lossy UDP
#[derive(Parser)]
#[command(name = "calcnet")]
#[command(author = "CalcNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Evaluate arithmetic expressions on a remote server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the calculator server
    Server {
        /// Probability in [0.0, 1.0] that an inbound UDP datagram is dropped
        drop_probability: Option<DropProbability>,

        /// Serve over TCP instead (never drops)
        #[arg(long)]
        tcp: bool,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed for the loss simulator
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Send every expression in a file to the server
    Client {
        /// File with one expression per line
        file: Option<PathBuf>,

        /// Connect over TCP instead of UDP
        #[arg(long)]
        tcp: bool,

        /// Server host
        #[arg(short, long)]
        server: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the request and response frames for expressions, without a network
    Inspect {
        /// Expressions such as "+ 1 2"
        #[arg(required = true)]
        expressions: Vec<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging; stdout is reserved for results
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let Some(command) = cli.command else {
        println!("{}", usage(None));
        return Ok(());
    };

    match command {
        Commands::Server {
            drop_probability,
            tcp,
            port,
            seed,
        } => {
            run_server(config, drop_probability, tcp, port, seed).await?;
        }
        Commands::Client {
            file,
            tcp,
            server,
            port,
        } => {
            let Some(file) = file else {
                println!("{}", usage(Some("client")));
                return Ok(());
            };
            run_client(config, file, tcp, server, port).await?;
        }
        Commands::Inspect { expressions } => {
            run_inspect(&config, &expressions)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                if let Some(path) = output {
                    config::sample_config().save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", config::generate_sample_config()?);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Usage line of the program, or of one of its subcommands
fn usage(subcommand: Option<&str>) -> String {
    let mut command = Cli::command();
    command.build();
    if let Some(sub) = subcommand.and_then(|name| command.find_subcommand_mut(name)) {
        return sub.render_usage().to_string();
    }
    command.render_usage().to_string()
}

/// Run the server until Ctrl+C
async fn run_server(
    config: Config,
    drop_probability: Option<DropProbability>,
    tcp: bool,
    port: Option<u16>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.server_port = port;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if tcp {
        if drop_probability.is_some() {
            tracing::warn!("Drop probability is ignored by the TCP server");
        }
        tracing::info!("Starting TCP server on {}:{}", net_config.host, net_config.server_port);
        println!("Press Ctrl+C to stop.");

        let stats = server::run_tcp(&net_config, &mut shutdown).await?;
        print_server_stats(&stats);
        return Ok(());
    }

    let Some(probability) = drop_probability.or(config.drop_probability()?) else {
        println!("{}", usage(Some("server")));
        return Ok(());
    };

    let simulator = match seed.or(config.simulator.seed) {
        Some(seed) => LossSimulator::seeded(probability, seed),
        None => LossSimulator::new(probability),
    };
    if probability == DropProbability::ALWAYS {
        tracing::warn!("Every datagram will be dropped");
    } else if probability == DropProbability::NEVER {
        tracing::info!("Loss simulation is off");
    }
    tracing::info!(
        "Starting UDP server on {}:{} with drop probability {}",
        net_config.host,
        net_config.server_port,
        probability
    );
    println!("Press Ctrl+C to stop.");

    let stats = server::run_udp(&net_config, simulator, &mut shutdown).await?;
    print_server_stats(&stats);
    Ok(())
}

fn print_server_stats(stats: &ServerStats) {
    println!("\nShutting down...");
    println!(
        "Received: {}, dropped: {}, answered: {}, rejected: {}",
        stats.received, stats.dropped, stats.answered, stats.rejected
    );
}

/// Run the batch client over the chosen transport
async fn run_client(
    config: Config,
    file: PathBuf,
    tcp: bool,
    server: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(host) = server {
        net_config.host = host;
    }
    if let Some(port) = port {
        net_config.server_port = port;
    }

    let expressions = batch::read_expressions(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let server_addr = net_config.server_addr().await?;
    let delay = config.line_delay();

    let summary = if tcp {
        let transport =
            TcpTransport::connect(server_addr, net_config.connect_timeout(), net_config.buffer_size)
                .await?;
        tracing::info!("Connected to {}", transport.peer());
        let mut client = Client::new(transport, server_addr, &net_config);

        let summary = batch::run_batch(&mut client, &expressions, delay, print_report).await;
        if let Err(e) = client.close().await {
            tracing::debug!("Error while closing connection: {}", e);
        }
        summary.context("Connection to server lost")?
    } else {
        let local_addr = net_config.client_addr(server_addr).await?;
        let transport = UdpTransport::bind(local_addr, net_config.buffer_size).await?;
        tracing::info!("UDP client bound to {}", transport.local_addr());

        let retry_policy = config.retry_policy()?;
        tracing::debug!(
            "Retrying from {:?} up to {:?}",
            retry_policy.initial_timeout(),
            retry_policy.max_timeout()
        );
        let mut client = Client::new(transport, server_addr, &net_config).with_retry_policy(retry_policy);

        let summary = batch::run_batch(&mut client, &expressions, delay, print_report).await;
        client.close().await?;
        summary?
    };

    tracing::info!(
        "Batch of {} finished: {} answered, {} invalid, {} timed out, {} broken",
        summary.total(),
        summary.answered,
        summary.invalid,
        summary.timed_out,
        summary.broken
    );
    Ok(())
}

fn print_report(report: &LineReport) {
    println!("\n-------------");
    println!("Reading line #{}.\n", report.line);
    println!("{}", report);
}

/// Build, evaluate and answer expressions locally
fn run_inspect(config: &Config, expressions: &[String]) -> anyhow::Result<()> {
    for (line, expression) in expressions.iter().enumerate() {
        let request = network::expression_request(&config.network.host, expression)?;
        println!("Making HTTP request...\n");
        println!("{}", String::from_utf8_lossy(&request));

        let (status, data) = server::answer(&request);
        let response = protocol::build_response(status, &data);
        println!("Server responds with:\n");
        println!("{}", String::from_utf8_lossy(&response));

        let result = match network::retry::interpret_reply(&response) {
            Outcome::Success(value) => LineResult::Answer(value),
            Outcome::Invalid(_) => LineResult::Invalid,
        };
        print_report(&LineReport {
            line,
            expression: expression.clone(),
            result,
        });
    }
    Ok(())
}
