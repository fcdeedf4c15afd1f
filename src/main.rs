//! # leaselock demo
//!
//! Runs the lock and registry scenarios against an embedded store.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use leaselock::{
    Client, ClientConfig, Discovery, LeaseManager, MemoryStore, Mutex, Registry, ServiceInstance,
};

/// Lease-based distributed locks and service registry on an etcd-style store.
#[derive(Parser, Debug)]
#[command(
    name = "leaselock",
    version,
    about = "Lease-based distributed locks and service registry",
    long_about = "Runs lease-bound mutex and service registry scenarios against an embedded store."
)]
struct Args {
    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to a JSON client configuration file.
    /// Fields that are not set keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Several workers contend for one lock, each holding it for a while.
    LockDemo {
        /// Number of contending workers.
        #[arg(long, default_value_t = 3)]
        workers: usize,

        /// Resource the workers contend for.
        #[arg(long, default_value = "my-distributed-lock")]
        resource: String,

        /// Lease TTL in seconds for each worker.
        #[arg(long, default_value_t = 5)]
        ttl: i64,

        /// How long each worker holds the lock, in milliseconds.
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },

    /// Registers service instances, resolves them, then deregisters.
    RegistryDemo {
        /// Service name.
        #[arg(long, default_value = "order_service")]
        name: String,

        /// Number of instances to register.
        #[arg(long, default_value_t = 2)]
        instances: usize,

        /// First port; instance N listens on base_port + N.
        #[arg(long, default_value_t = 8080)]
        base_port: u16,

        /// Number of resolutions to perform.
        #[arg(long, default_value_t = 10)]
        resolves: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };

    let client = Client::new(MemoryStore::new(), config)?;

    let run = async {
        match args.command {
            Command::LockDemo {
                workers,
                resource,
                ttl,
                hold_ms,
            } => run_lock_demo(client, workers, resource, ttl, hold_ms).await,
            Command::RegistryDemo {
                name,
                instances,
                base_port,
                resolves,
            } => run_registry_demo(client, name, instances, base_port, resolves).await,
        }
    };

    tokio::select! {
        result = run => {
            if let Err(e) = &result {
                error!("Demo failed: {:?}", e);
            }
            result
        }
        _ = shutdown_signal() => {
            info!("Interrupted, leases will expire on their own");
            Ok(())
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

async fn run_lock_demo(
    client: Client,
    workers: usize,
    resource: String,
    ttl: i64,
    hold_ms: u64,
) -> anyhow::Result<()> {
    info!(workers, resource = %resource, ttl, "Starting lock demo");

    let mut tasks = Vec::with_capacity(workers);
    for worker in 0..workers {
        let client = client.clone();
        let resource = resource.clone();
        tasks.push(tokio::spawn(async move {
            let renewal = LeaseManager::new(client.clone()).grant(ttl).await?;
            let lock = Mutex::new(client, renewal.handle(), resource);

            lock.lock().await?;
            info!(worker, key = %lock.key(), "Worker entered critical section");
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            lock.unlock().await?;
            info!(worker, "Worker left critical section");

            renewal.revoke().await?;
            Ok::<_, leaselock::Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    info!("Lock demo finished");
    Ok(())
}

async fn run_registry_demo(
    client: Client,
    name: String,
    instances: usize,
    base_port: u16,
    resolves: usize,
) -> anyhow::Result<()> {
    info!(service = %name, instances, "Starting registry demo");

    let discovery = Discovery::new(client.clone());
    let mut watch = discovery.watch(&name).await?;
    let watcher = tokio::spawn(async move {
        while let Some(change) = watch.next_change().await {
            info!(?change, live = ?watch.addresses(), "Service changed");
        }
    });

    let mut registry = Registry::new(client.clone());
    for n in 0..instances {
        let addr = format!("127.0.0.1:{}", u32::from(base_port) + n as u32);
        registry.register(&ServiceInstance::new(&name, addr)).await?;
    }

    for _ in 0..resolves {
        let addr = discovery.resolve(&name).await?;
        info!(service = %name, addr = %addr, "Resolved");
    }

    registry.deregister().await?;
    match discovery.resolve(&name).await {
        Err(leaselock::Error::NotFound(_)) => info!(service = %name, "All instances gone"),
        Ok(addr) => warn!(addr = %addr, "Instance still registered after deregister"),
        Err(e) => return Err(e.into()),
    }

    // Let the watcher print the removals.
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.abort();

    info!("Registry demo finished");
    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received interrupt signal");
}
