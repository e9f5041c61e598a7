//! audit-log-operator - persists hosted control plane API server audit logs.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Starts the health server and, when certificates are mounted, the
//!   admission webhook server on every replica
//! - Runs leader election and starts the snapshot controller on the leader

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tracing::{error, info, warn};

use audit_log_operator::client::{PersistenceKubeClient, PersistenceKubeClientImpl};
use audit_log_operator::health::{HealthState, run_health_server};
use audit_log_operator::run_controller_scoped;
use audit_log_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

/// Lease held by the replica that runs the snapshot controller. Only one
/// replica may record restart counts and take snapshots at a time; webhooks
/// are served by every replica regardless of the lease.
const LEASE_NAME: &str = "audit-log-operator-leader";
/// A standby replica takes over snapshotting this long after renewals stop.
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Time given to an in-flight snapshot pass to finish its annotation writes
/// before the process exits.
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audit_log_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting audit-log-operator");

    // axum-server and kube both link rustls; pick the provider explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");
    let kube: Arc<dyn PersistenceKubeClient> =
        Arc::new(PersistenceKubeClientImpl::new(client.clone()));

    // Restrict the controller to one namespace when set
    let watch_namespace = std::env::var("WATCH_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty());

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    // Whether this replica currently runs the snapshot controller
    let is_leader = Arc::new(AtomicBool::new(false));

    // Probes must answer on standby replicas too
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Admission runs on every replica, leader or not
    let webhook_handle =
        if Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists() {
            info!("TLS certificates found, starting webhook server");
            let webhook_kube = kube.clone();
            let webhook_health = health_state.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = run_webhook_server(
                    webhook_kube,
                    Some(webhook_health),
                    WEBHOOK_CERT_PATH,
                    WEBHOOK_KEY_PATH,
                )
                .await
                {
                    error!("Webhook server error: {}", e);
                }
            }))
        } else {
            info!("Webhook certificates not found, webhook server disabled");
            None
        };

    // Probes and admission are served from here on
    health_state.set_ready(true).await;

    // Create leader election lease lock
    let lease_lock = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id: pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    // Snapshot state lives in pod annotations; a single writer keeps restart
    // counts from being consumed twice
    info!("Waiting for the snapshot controller lease...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) => {
                if matches!(result, LeaseLockResult::Acquired(_)) {
                    info!("Acquired lease, this replica takes snapshots");
                    is_leader.store(true, Ordering::SeqCst);
                    break;
                } else {
                    info!("Another replica holds the snapshot controller lease, waiting...");
                }
            }
            Err(e) => {
                warn!("Failed to acquire lease: {}, retrying...", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    // Keep the lease; a replica that loses it must stop snapshotting at once
    let lease_renewal_handle = {
        let is_leader = is_leader.clone();
        let lease_lock = LeaseLock::new(
            client.clone(),
            &namespace,
            LeaseLockParams {
                holder_id: pod_name,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );

        #[allow(clippy::exit)]
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) => {
                        if !matches!(result, LeaseLockResult::Acquired(_)) {
                            error!("Lost the snapshot controller lease, exiting");
                            is_leader.store(false, Ordering::SeqCst);
                            // The restarted pod serves webhooks again and waits for the lease
                            std::process::exit(1);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to renew the snapshot controller lease, exiting");
                        is_leader.store(false, Ordering::SeqCst);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    // Watch API server pods and snapshot on restart
    let controller_handle = {
        let health_state = health_state.clone();
        let controller_client = client.clone();
        let controller_kube = kube.clone();
        tokio::spawn(async move {
            run_controller_scoped(
                controller_client,
                controller_kube,
                Some(health_state),
                watch_namespace.as_deref(),
            )
            .await;
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        // Renewal only ends by exiting the process or panicking
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Drop out of the webhook Service endpoints first
            health_state.set_ready(false).await;
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD_SECS,
                "Not ready; draining admissions and snapshot passes"
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT.
///
/// Without signal handlers the pod could only be killed, never drained, so
/// failing to install them aborts startup.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
