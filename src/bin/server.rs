use std::sync::Arc;

use clap::Parser;
use tokio::{select, signal};
use tonic::transport::Server as GrpcServer;
use tracing::{error, info};

use flowlog::config::{init_config, ConfigMembership, CONFIG, DEFAULT_CONFIG_FILE};
use flowlog::connections::GrpcRestoreTransport;
use flowlog::partition::{Partition, PartitionRegistry};
use flowlog::restore::{RestoreClient, RestoreGrpcService, RestoreServer};
use flowlog::restore_pb::restore_service_server::RestoreServiceServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = DEFAULT_CONFIG_FILE.to_string())]
    config: String,
    #[arg(long)]
    name: Option<String>,
    /// Catch up lagging partitions from their leaders before serving.
    #[arg(long, default_value_t = false)]
    restore: bool,
}

async fn restore_partitions(registry: &PartitionRegistry) {
    let config = CONFIG.read().clone();
    let membership = Arc::new(ConfigMembership::from_config(&config));
    let transport = Arc::new(GrpcRestoreTransport::with_timeout(
        config.restore.request_timeout(),
    ));

    for p in &config.partitions {
        if p.leader.is_none() {
            continue;
        }
        let Some(partition) = registry.get(p.id).await else {
            continue;
        };

        let client = RestoreClient::new(
            p.id,
            membership.clone(),
            transport.clone(),
            config.restore.options(),
        );
        match client.run(&partition.stream, &partition.snapshots).await {
            Ok(result) => info!(
                "partition {} caught up at position {}",
                p.id, result.last_position
            ),
            Err(e) => error!("failed to restore partition {}, err: {e}", p.id),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("starting flowlog server...");
    init_config(&args.config)
        .inspect_err(|e| error!("failed to initialize configuration, err: {e}"))?;

    if let Some(name) = args.name {
        info!("overriding name from command line argument: {}", name);
        CONFIG.write().name = name;
    }

    let (data_dir, partitions, log_options) = {
        let config = CONFIG.read();
        (
            config.data_dir.clone(),
            config.partitions.clone(),
            config.log.options(),
        )
    };

    let registry = Arc::new(PartitionRegistry::new());
    for p in &partitions {
        let partition = Partition::open(p.id, &data_dir, log_options.clone())
            .await
            .inspect_err(|e| error!("failed to open partition {}, err: {e}", p.id))?;
        registry.insert(Arc::new(partition)).await;
    }

    if args.restore {
        restore_partitions(&registry).await;
    }

    let grpc_server_addr = CONFIG.read().listen_addr.parse()?;
    let service = RestoreGrpcService::new(RestoreServer::new(registry.clone()));
    tokio::spawn(async move {
        info!("starting restore rpc server...");
        let grpc_server =
            GrpcServer::builder().add_service(RestoreServiceServer::new(service));
        if let Err(e) = grpc_server.serve(grpc_server_addr).await {
            error!("grpc server failed, err: {e}");
        }
        info!("stop grpc server");
    });

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    select! {
        _ = signal::ctrl_c() => {
            info!("ctrl-c pressed");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        },
    };

    registry.close_all().await;

    Ok(())
}
