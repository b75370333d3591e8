//! pwrctld: hierarchical power/performance control plane daemon
//!
//! Drives one node's vertical slice of the control tree:
//! - Samples hardware telemetry through the many-core `PlatformImp`
//! - Aggregates it into per-level regions and exchanges it over the
//!   tree fabric
//! - Reads the operator-authored `GlobalPolicy` at the root and scatters
//!   derived policy back down to the leaf decider
//! - Exposes a read-only status and policy-push HTTP surface
//!
//! Default bind: 127.0.0.1:8910
//! REST API: /api/v1/*

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pwrctld::api::{self, AppState};
use pwrctld::config::RuntimeConfig;
use pwrctld::controller::{Controller, RegionMarker};
use pwrctld::fabric::ChannelFabric;
use pwrctld::global_policy::{GlobalPolicy, PolicyDescriptor};
use pwrctld::platform::Platform;
use pwrctld::platform_imp::{FileMsrBackend, ManyCorePlatformImp, PlatformImp, Topology};
use pwrctld::policy::Mode;
use pwrctld::tree::TreeCommunicator;
use tokio::sync::Mutex as AsyncMutex;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true).with_thread_names(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pwrctld=debug")))
        .init();

    info!("Starting pwrctld (hierarchical power/performance control plane)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::from_env();
    let bind_addr = config.bind_addr.parse::<SocketAddr>()?;

    // Single-node vertical slice: one leaf region, one tree level. A
    // real deployment builds its fan_out from the job's rank count and
    // wires each rank's TreeCommunicator edges over the real fabric;
    // process launch/MPI bootstrap is out of core scope (spec section 1).
    let topology = Topology {
        num_package: 1,
        num_tile: pwrctld::msr_table::NUM_TILE as u32,
        num_logical_cpu: pwrctld::msr_table::NUM_TILE as u32 * 4,
        num_cpu_per_core: 4,
    };
    let mut imp = ManyCorePlatformImp::new(FileMsrBackend::new(), topology);
    if let Err(e) = imp.msr_initialize() {
        warn!(error = %e, "msr_initialize failed, continuing with unprogrammed counters");
    }
    let platform = Platform::new(imp);
    let tree = TreeCommunicator::new(vec![1], vec![ChannelFabric::new()])?;

    let descriptor = PolicyDescriptor::parse(&config.policy_descriptor);
    let global_policy = GlobalPolicy::new(Some(descriptor.clone()), None);
    let http_global_policy = Arc::new(AsyncMutex::new(GlobalPolicy::new(None, Some(descriptor))));

    let mut controller = Controller::new(platform, tree, Mode::Shutdown, Some(global_policy), config.control_period);
    let status = Arc::new(RwLock::new(controller.status()));

    let status_for_loop = Arc::clone(&status);
    let period = config.control_period;
    let marker = RegionMarker { region_id: 0, runtime: 0.0, progress: 0.0 };
    let _controller_task: tokio::task::JoinHandle<()> = tokio::spawn(async move {
        loop {
            if let Err(e) = controller.step(marker) {
                warn!(error = %e, "controller step failed, stopping control loop");
                break;
            }
            *status_for_loop.write().expect("status lock poisoned") = controller.status();
            tokio::time::sleep(period).await;
        }
    });

    let state = AppState { global_policy: http_global_policy, status };
    let app = api::create_router(state);

    info!("Binding to {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("pwrctld listening on http://{}", bind_addr);
    info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
