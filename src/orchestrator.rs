//! Component wiring and lifecycle
//!
//! Builds the graph — scan loop → reconcilers → cleaner — and runs the row
//! dispatch loop until shutdown. Dispatch order per row is fixed:
//! Deployment reconciler, then VPA reconciler (when enabled), then cleaner
//! heartbeat, so a duplicate exists before its first heartbeat matters.
//! Nothing is deleted on shutdown.

use std::pin::pin;
use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc;
use tracing::info;

use crate::cleaner::Cleaner;
use crate::config::Config;
use crate::controller::template_watch::{
    run_deployment_watch, run_vpa_watch, DeploymentWatchContext, VpaWatchContext,
};
use crate::controller::{
    DeploymentAdapter, DeploymentEngine, DuplicateEngine, KubeDeploymentStore, KubeVpaStore,
    VpaAdapter, VpaEngine,
};
use crate::error::Result;
use crate::tablewatch::{Row, TableWatch};

/// Build everything and run until the process receives a shutdown signal.
/// Errors escape only during startup; afterwards every failure is handled
/// inside the components.
pub async fn run(config: Config) -> Result<()> {
    let watcher = TableWatch::new(&config).await?;

    let client = Client::try_default().await?;

    let deployment_engine: Arc<DeploymentEngine> = Arc::new(DuplicateEngine::new(
        DeploymentAdapter::new(
            KubeDeploymentStore::new(client.clone(), &config.template_namespace),
            config.template_name.clone(),
            config.env_binding.clone(),
            config.exclude_labels.clone(),
        ),
        config.suffix_column.clone(),
    ));

    let vpa_engine: Option<Arc<VpaEngine>> = config.vpa_template_name.as_ref().map(|vpa_name| {
        Arc::new(DuplicateEngine::new(
            VpaAdapter::new(
                KubeVpaStore::new(client.clone(), &config.template_namespace),
                vpa_name.clone(),
                config.template_name.clone(),
            ),
            config.suffix_column.clone(),
        ))
    });

    let (row_tx, mut row_rx) = mpsc::channel::<Row>(1);
    let (remove_tx, mut remove_rx) = mpsc::channel::<String>(1);

    let (cleaner, cleaner_handle) =
        Cleaner::new(config.clean_interval, config.suffix_column.clone(), remove_tx);
    tokio::spawn(cleaner.run());

    // Cleaner removals feed the Deployment reconciler.
    {
        let engine = Arc::clone(&deployment_engine);
        tokio::spawn(async move {
            while let Some(suffix) = remove_rx.recv().await {
                engine.on_removal(&suffix).await;
            }
        });
    }

    tokio::spawn(watcher.watch(config.check_interval, row_tx));

    tokio::spawn(run_deployment_watch(
        client.clone(),
        Arc::new(DeploymentWatchContext {
            engine: Arc::clone(&deployment_engine),
            template_namespace: config.template_namespace.clone(),
            template_name: config.template_name.clone(),
        }),
    ));

    if let (Some(engine), Some(vpa_name)) =
        (vpa_engine.as_ref(), config.vpa_template_name.as_ref())
    {
        tokio::spawn(run_vpa_watch(
            client.clone(),
            Arc::new(VpaWatchContext {
                engine: Arc::clone(engine),
                template_namespace: config.template_namespace.clone(),
                template_name: vpa_name.clone(),
            }),
        ));
    }

    info!(
        template = %config.template_name,
        namespace = %config.template_namespace,
        vpa = config.vpa_template_name.as_deref().unwrap_or("<disabled>"),
        "database scaler started"
    );

    let mut shutdown = pin!(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            row = row_rx.recv() => match row {
                Some(row) => {
                    deployment_engine.on_row(&row).await;
                    if let Some(vpa_engine) = &vpa_engine {
                        vpa_engine.on_row(&row).await;
                    }
                    cleaner_handle.on_row(&row).await;
                }
                None => break,
            },
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
