use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use slotd::config::{
    DynamicConfig, JobEnvironmentConfig, JobEnvironmentKind, LocationConfig, SlotManagerConfig,
    TestingConfig,
};
use slotd::controller::JobController;
use slotd::dashboard::{run_dashboard, DashboardState};
use slotd::medium::MediumDirectory;
use slotd::shutdown::install_shutdown_handler;
use slotd::slots::SlotManager;

#[derive(Parser, Debug)]
#[command(name = "slotd")]
#[command(about = "Execution-slot manager for worker nodes in a distributed job cluster")]
struct Args {
    /// Number of execution slots this node offers
    #[arg(long, default_value = "8")]
    slot_count: usize,

    /// Total CPU budget handed to the job environment
    #[arg(long, default_value = "8.0")]
    cpu: f64,

    /// Fraction of the CPU budget reserved for the idle pool
    #[arg(long, default_value = "0.0")]
    idle_cpu_fraction: f64,

    /// Port for the dashboard API
    #[arg(long, default_value = "9090")]
    port: u16,

    /// Slot locations (repeatable, format: "path:medium")
    /// Example: --location /mnt/ssd/slots:ssd --location /mnt/hdd/slots:hdd
    #[arg(long = "location")]
    locations: Vec<String>,

    /// Medium used for requests that do not name one explicitly
    #[arg(long, default_value = "default")]
    default_medium: String,

    /// Run jobs in containers instead of plain child processes
    #[arg(long)]
    container: bool,

    /// Image used by the container environment
    #[arg(long, default_value = "ubuntu:24.04")]
    image: String,

    /// Root directory of the container volume store
    #[arg(long, default_value = "volumes")]
    volumes_path: PathBuf,
}

fn parse_locations(specs: &[String]) -> Vec<LocationConfig> {
    specs
        .iter()
        .filter_map(|spec| match spec.rsplit_once(':') {
            Some((path, medium)) if !path.is_empty() && !medium.is_empty() => {
                Some(LocationConfig::new(path, medium))
            }
            _ => {
                tracing::warn!(location = %spec, "Invalid location format, expected path:medium");
                None
            }
        })
        .collect()
}

/// Builds a medium directory covering every medium the node references.
/// Indices are assigned from 1; index 0 is the generic placeholder.
fn build_medium_directory(locations: &[LocationConfig], default_medium: &str) -> MediumDirectory {
    let mut directory = MediumDirectory::new();
    let mut next_index = 1;
    let mut seen = std::collections::HashSet::new();
    for name in locations
        .iter()
        .map(|location| location.medium_name.as_str())
        .chain(std::iter::once(default_medium))
    {
        if seen.insert(name.to_string()) {
            directory.register(name, next_index);
            next_index += 1;
        }
    }
    directory
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut locations = parse_locations(&args.locations);
    if locations.is_empty() {
        locations.push(LocationConfig::new("slots", args.default_medium.clone()));
    }
    let medium_directory = build_medium_directory(&locations, &args.default_medium);

    let config = SlotManagerConfig {
        slot_count: args.slot_count,
        cpu_limit: args.cpu,
        locations,
        job_environment: JobEnvironmentConfig {
            kind: if args.container {
                JobEnvironmentKind::Container
            } else {
                JobEnvironmentKind::Process
            },
            container_image: args.image,
            ..JobEnvironmentConfig::default()
        },
        default_medium_name: args.default_medium,
        idle_cpu_fraction: args.idle_cpu_fraction,
        volumes_path: args.volumes_path,
        port: args.port,
        testing: TestingConfig::default(),
        ..SlotManagerConfig::default()
    };

    tracing::info!(
        node_tag = %config.node_tag(),
        slot_count = config.slot_count,
        cpu_limit = config.cpu_limit,
        locations = config.locations.len(),
        "Starting slotd node"
    );

    let manager = SlotManager::new(config);
    manager.initialize()?;
    manager.init_media(&medium_directory)?;

    // The job proxy ships inside this binary, so report it available
    // immediately.
    manager.on_job_proxy_build_info_updated(Ok(()));

    // Dynamic-config and CPU-limit publishers; held for the process lifetime.
    let (_dynamic_config_tx, dynamic_config_rx) = watch::channel(DynamicConfig::default());
    manager.subscribe_dynamic_config(dynamic_config_rx);
    let (_cpu_limit_tx, cpu_limit_rx) = watch::channel(args.cpu);
    manager.subscribe_jobs_cpu_limit_updates(cpu_limit_rx);

    let shutdown = install_shutdown_handler();

    let (controller, dispatch_rx) = JobController::new(manager.clone());
    let dispatch_controller = controller.clone();
    let dispatch_shutdown = shutdown.clone();
    tokio::spawn(async move {
        dispatch_controller.run(dispatch_rx, dispatch_shutdown).await;
    });

    let dashboard_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_state = DashboardState {
        manager: manager.clone(),
        controller,
    };
    tokio::spawn(async move {
        run_dashboard(dashboard_addr, dashboard_state).await;
    });

    shutdown.cancelled().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
