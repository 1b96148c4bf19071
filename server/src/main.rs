use clap::Parser;
use log::{error, info};
use server::config::{ServerConfig, StaleRecordPolicy, DEFAULT_CSV_PATH, DEFAULT_MAX_CLIENTS};
use server::network::Server;
use server::sink::{
    CsvSink, DurationAdjustment, DEFAULT_ALTERNATE_CONDITION,
    DEFAULT_CONDITION_OFFSET_SECS,
};
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// CSV file completed card records are appended to
    #[clap(short, long, default_value = DEFAULT_CSV_PATH)]
    csv_path: PathBuf,
    /// Maximum number of simultaneous connections
    #[clap(short, long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
    /// Robot condition whose move durations are shifted
    #[clap(long, default_value = DEFAULT_ALTERNATE_CONDITION)]
    alternate_condition: String,
    /// Seconds subtracted from the move duration under the alternate condition
    #[clap(long, default_value_t = DEFAULT_CONDITION_OFFSET_SECS)]
    condition_offset_secs: f64,
    /// Drop incomplete records untouched for this many seconds
    #[clap(long)]
    evict_after_secs: Option<u64>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: format!("{}:{}", args.host, args.port),
            csv_path: args.csv_path,
            max_clients: args.max_clients,
            adjustment: DurationAdjustment {
                condition: args.alternate_condition,
                offset_secs: args.condition_offset_secs,
            },
            stale_records: args
                .evict_after_secs
                .map(|secs| StaleRecordPolicy::new(Duration::from_secs(secs))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());

    let sink = CsvSink::new(&config.csv_path);
    sink.ensure_header()?;

    let server = Server::bind(&config, Box::new(sink)).await?;
    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
