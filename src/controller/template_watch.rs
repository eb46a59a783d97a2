//! Template watch plumbing
//!
//! kube-runtime Controllers watch the template's kind in the template's
//! namespace and funnel events for the template object itself into the
//! engine. Duplicates share that kind and namespace, so every event for
//! anything but the template returns immediately. Change vs. deletion is
//! classified by re-fetching the template.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{debug, error, warn};

use crate::controller::deployment::DeploymentStore;
use crate::controller::vpa::{vpa_resource, VpaStore};
use crate::controller::{DeploymentAdapter, DuplicateEngine, VpaAdapter};
use crate::error::Error;

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Context for the Deployment template reconciler.
pub struct DeploymentWatchContext<S: DeploymentStore> {
    pub engine: Arc<DuplicateEngine<DeploymentAdapter<S>>>,
    pub template_namespace: String,
    pub template_name: String,
}

/// Reconcile one Deployment event; only the template itself is acted on.
pub async fn reconcile_deployment<S: DeploymentStore>(
    deployment: Arc<Deployment>,
    ctx: Arc<DeploymentWatchContext<S>>,
) -> Result<Action, Error> {
    if deployment.namespace().as_deref() != Some(ctx.template_namespace.as_str())
        || deployment.name_any() != ctx.template_name
    {
        return Ok(Action::await_change());
    }

    debug!(name = %ctx.template_name, "template deployment event");
    ctx.engine.reconcile_template().await?;

    Ok(Action::await_change())
}

pub fn error_policy_deployment<S: DeploymentStore>(
    _deployment: Arc<Deployment>,
    error: &Error,
    _ctx: Arc<DeploymentWatchContext<S>>,
) -> Action {
    warn!(error = %error, "template reconcile failed, will retry");
    Action::requeue(ERROR_REQUEUE)
}

/// Drive the Deployment template controller until shutdown.
pub async fn run_deployment_watch<S>(client: Client, ctx: Arc<DeploymentWatchContext<S>>)
where
    S: DeploymentStore + 'static,
{
    let api: Api<Deployment> = Api::namespaced(client, &ctx.template_namespace);

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_deployment, error_policy_deployment, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => debug!("deployment template reconciliation completed"),
                Err(e) => error!(error = ?e, "deployment template reconciliation error"),
            }
        })
        .await;
}

/// Context for the VPA template reconciler.
pub struct VpaWatchContext<S: VpaStore> {
    pub engine: Arc<DuplicateEngine<VpaAdapter<S>>>,
    pub template_namespace: String,
    pub template_name: String,
}

/// Reconcile one VPA event; only the template itself is acted on.
pub async fn reconcile_vpa<S: VpaStore>(
    vpa: Arc<DynamicObject>,
    ctx: Arc<VpaWatchContext<S>>,
) -> Result<Action, Error> {
    if vpa.namespace().as_deref() != Some(ctx.template_namespace.as_str())
        || vpa.name_any() != ctx.template_name
    {
        return Ok(Action::await_change());
    }

    debug!(name = %ctx.template_name, "template vpa event");
    ctx.engine.reconcile_template().await?;

    Ok(Action::await_change())
}

pub fn error_policy_vpa<S: VpaStore>(
    _vpa: Arc<DynamicObject>,
    error: &Error,
    _ctx: Arc<VpaWatchContext<S>>,
) -> Action {
    warn!(error = %error, "vpa template reconcile failed, will retry");
    Action::requeue(ERROR_REQUEUE)
}

/// Drive the VPA template controller until shutdown.
pub async fn run_vpa_watch<S>(client: Client, ctx: Arc<VpaWatchContext<S>>)
where
    S: VpaStore + 'static,
{
    let api: Api<DynamicObject> =
        Api::namespaced_with(client, &ctx.template_namespace, &vpa_resource());

    Controller::new_with(api, WatcherConfig::default(), vpa_resource())
        .shutdown_on_signal()
        .run(reconcile_vpa, error_policy_vpa, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => debug!("vpa template reconciliation completed"),
                Err(e) => error!(error = ?e, "vpa template reconciliation error"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvBinding;
    use crate::controller::deployment::MockDeploymentStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn context(store: MockDeploymentStore) -> Arc<DeploymentWatchContext<MockDeploymentStore>> {
        Arc::new(DeploymentWatchContext {
            engine: Arc::new(DuplicateEngine::new(
                DeploymentAdapter::new(store, "t", EnvBinding::default(), Vec::new()),
                "id",
            )),
            template_namespace: "n".to_string(),
            template_name: "t".to_string(),
        })
    }

    fn deployment(namespace: &str, name: &str) -> Arc<Deployment> {
        Arc::new(Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn events_for_other_objects_are_ignored() {
        // No store expectations: touching the cluster fails the test. This
        // is what keeps duplicates (same kind, same namespace) from
        // re-triggering template logic.
        let ctx = context(MockDeploymentStore::new());

        reconcile_deployment(deployment("n", "t-a"), ctx.clone())
            .await
            .unwrap();
        reconcile_deployment(deployment("elsewhere", "t"), ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn template_event_drives_the_engine() {
        let mut store = MockDeploymentStore::new();
        store
            .expect_get()
            .withf(|name| name == "t")
            .times(1)
            .returning(|_| Ok(None));
        store.expect_list().times(1).returning(|| Ok(vec![]));

        reconcile_deployment(deployment("n", "t"), context(store))
            .await
            .unwrap();
    }
}
