//! Coordinator binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsmeta::{Coordinator, MetaConfig};

#[derive(Parser)]
#[command(name = "tsmeta")]
#[command(about = "Metadata coordinator for a distributed time-series database")]
#[command(version = tsmeta::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator server
    Serve {
        /// Node ID of this coordinator instance
        #[arg(long)]
        id: String,

        /// Bind address for HTTP
        #[arg(long, default_value = "0.0.0.0:5000")]
        http: String,

        /// Bind address for gRPC
        #[arg(long, default_value = "0.0.0.0:8831")]
        grpc: String,

        /// Advertised gRPC endpoint (defaults to the bind address)
        #[arg(long, default_value = "")]
        advertise: String,

        /// Backing store directory
        #[arg(long, default_value = "./meta-data")]
        db: PathBuf,

        /// Logical shard count for the cluster
        #[arg(long, default_value = "256")]
        shards: u32,

        /// Optional JSON config file; CLI flags take priority
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            http,
            grpc,
            advertise,
            db,
            shards,
            config,
        } => {
            let mut meta_config = match config {
                Some(path) => MetaConfig::from_file(path)?,
                None => MetaConfig::default(),
            };
            meta_config.node_id = id;
            meta_config.http_addr = http.parse()?;
            meta_config.grpc_addr = grpc.parse()?;
            meta_config.advertise_endpoint = advertise;
            meta_config.http_port = meta_config.http_addr.port();
            meta_config.db_path = db;
            meta_config.cluster.num_total_shards = shards;

            let coordinator = Coordinator::open(meta_config)?;
            coordinator.serve().await?;
        }
    }

    Ok(())
}
