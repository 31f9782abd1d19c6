use std::process::exit;

use clap::Parser;
use cli::{Cli, LogLevel};
use kube::{runtime::reflector::Store, Client};
use k8s_openapi::api::core::v1::Node;
use log::{debug, error, info, LevelFilter};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use vxlan_cni_core::{config::OverlaySettings, devices::IpRoute2, directory::KubeDirectory};

use crate::{
    bootstrap::{Bootstrapper, NodeOverlay},
    mesh::MeshReconciler,
    node::{members_of, start_node_reflector},
    status::StatusFile,
};

mod bootstrap;
mod cli;
mod error;
mod mesh;
mod node;
mod status;

#[tokio::main()]
async fn main() {
    let cli = Cli::parse();
    configure_logger(&cli);

    let settings = match cli.overlay_settings() {
        Ok(settings) => settings,
        Err(error) => {
            error!("Invalid overlay settings! {error}");
            exit(2)
        }
    };
    let client = create_client().await;
    let mut status = StatusFile::new(&cli.status_file);

    let stopped_unexpectedly = tokio::select! {
        _ = run(&cli, &settings, &client, &mut status) => true,
        _ = shutdown_signal() => false,
    };

    status.remove().await;

    if stopped_unexpectedly {
        error!("Node watch has stopped, exiting!");
        exit(1)
    }

    info!("Shutting down...");
}

async fn run(cli: &Cli, settings: &OverlaySettings, client: &Client, status: &mut StatusFile) {
    let devices = IpRoute2::new();
    let directory = KubeDirectory::new(client.clone());
    let bootstrapper = Bootstrapper {
        devices: &devices,
        directory: &directory,
        settings,
        cni_config_path: &cli.cni_config_path,
    };

    let overlay = bootstrap(&bootstrapper, cli, status).await;
    let mut mesh = MeshReconciler::new(&devices, &overlay.vxlan_name, &overlay.member);

    let (reflector, store, mut changes) = start_node_reflector(client);
    tokio::pin!(reflector);

    let resync_interval = cli.resync_interval();
    let mut resync = interval_at(Instant::now() + resync_interval, resync_interval);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut reflector => return,
            Some(()) = changes.recv() => {
                while changes.try_recv().is_ok() {}
            }
            _ = resync.tick() => debug!("Resyncing the mesh..."),
        }

        reconcile_mesh(&mut mesh, &store, status).await;
    }
}

async fn bootstrap(
    bootstrapper: &Bootstrapper<'_, IpRoute2, KubeDirectory>,
    cli: &Cli,
    status: &mut StatusFile,
) -> NodeOverlay {
    loop {
        match bootstrapper.run().await {
            Ok(overlay) => return overlay,
            Err(error) => {
                error!("Couldn't bootstrap the node! {error}");
                status.mark_failed(&error).await;
            }
        }

        sleep(cli.retry_interval()).await;
    }
}

async fn reconcile_mesh(
    mesh: &mut MeshReconciler<'_, IpRoute2>,
    store: &Store<Node>,
    status: &mut StatusFile,
) {
    match mesh.reconcile(&members_of(store)) {
        Ok(changes) => {
            if !changes.is_empty() {
                info!(
                    "Mesh updated: {} peer(s) added, {} removed, {} pending",
                    changes.installed, changes.removed, changes.pending
                );
            }
            status.mark_ready().await;
        }
        Err(error) => {
            error!("Couldn't reconcile the mesh! {error}");
            status.mark_failed(&error).await;
        }
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            error!("Couldn't listen for SIGTERM! {error}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

fn configure_logger(cli: &Cli) {
    let mut logger = env_logger::builder();

    logger.default_format().format_module_path(false);

    match cli.get_log_level() {
        LogLevel::Normal => logger.filter_level(LevelFilter::Info),
        LogLevel::Verbose => logger
            .filter_level(LevelFilter::Info)
            .filter(Some("vxlan_cni"), LevelFilter::Debug),
        LogLevel::Trace => logger.filter_level(LevelFilter::Trace),
    };

    logger.parse_default_env().init()
}
