//! Deployment duplication
//!
//! The Deployment adapter carries the env binding and the generation
//! tracking: every duplicate records the template's observed generation at
//! creation time and is replaced when it moves, and the duplicate's env
//! values are the persisted source of its row state (the controller keeps
//! nothing across restarts).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::config::EnvBinding;
use crate::controller::engine::KindAdapter;
use crate::controller::{DEPLOYMENT_ID_ANNOTATION, ORIGINAL_OBSERVED_GENERATION_ANNOTATION};
use crate::error::{Error, Result};
use crate::tablewatch::Row;

/// Cluster-side CRUD over Deployments in the template's namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Get by name; `None` on NotFound.
    async fn get(&self, name: &str) -> Result<Option<Deployment>>;

    /// All Deployments in the namespace.
    async fn list(&self) -> Result<Vec<Deployment>>;

    async fn create(&self, deployment: &Deployment) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`DeploymentStore`] backed by the Kubernetes API.
pub struct KubeDeploymentStore {
    api: Api<Deployment>,
}

impl KubeDeploymentStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl DeploymentStore for KubeDeploymentStore {
    async fn get(&self, name: &str) -> Result<Option<Deployment>> {
        match self.api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, deployment: &Deployment) -> Result<()> {
        self.api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Kind adapter for Deployment duplication.
pub struct DeploymentAdapter<S> {
    store: S,
    template_name: String,
    env_binding: EnvBinding,
    exclude_labels: Vec<String>,
}

impl<S> DeploymentAdapter<S> {
    pub fn new(
        store: S,
        template_name: impl Into<String>,
        env_binding: EnvBinding,
        exclude_labels: Vec<String>,
    ) -> Self {
        Self {
            store,
            template_name: template_name.into(),
            env_binding,
            exclude_labels,
        }
    }
}

#[async_trait]
impl<S: DeploymentStore> KindAdapter for DeploymentAdapter<S> {
    type Object = Deployment;
    /// `(env name, value)` pairs in binding order.
    type Context = Vec<(String, String)>;

    fn kind(&self) -> &'static str {
        "deployment"
    }

    fn id_annotation(&self) -> &'static str {
        DEPLOYMENT_ID_ANNOTATION
    }

    fn duplicate_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.template_name, suffix)
    }

    async fn fetch_template(&self) -> Result<Option<Deployment>> {
        self.store.get(&self.template_name).await
    }

    async fn get(&self, name: &str) -> Result<Option<Deployment>> {
        self.store.get(name).await
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        self.store.list().await
    }

    async fn create(&self, object: &Deployment) -> Result<()> {
        self.store.create(object).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(name).await
    }

    fn metadata<'a>(&self, object: &'a Deployment) -> &'a ObjectMeta {
        &object.metadata
    }

    fn needs_replace(&self, template: &Deployment, duplicate: &Deployment) -> Result<bool> {
        let current = observed_generation(template);

        let recorded = duplicate
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ORIGINAL_OBSERVED_GENERATION_ANNOTATION))
            .ok_or_else(|| {
                Error::duplicate(format!(
                    "no observed-generation annotation on {}",
                    duplicate.metadata.name.as_deref().unwrap_or("<unnamed>")
                ))
            })?;

        Ok(*recorded != current)
    }

    fn context_from_row(&self, row: &Row) -> Result<Self::Context> {
        self.env_binding
            .entries()
            .iter()
            .map(|(env_name, column)| {
                row.get(column)
                    .map(|value| (env_name.clone(), value.clone()))
                    .ok_or_else(|| {
                        Error::row(format!("value of column {column} not found in row"))
                    })
            })
            .collect()
    }

    fn context_from_duplicate(&self, duplicate: &Deployment) -> Result<Self::Context> {
        let all_envs: Vec<&EnvVar> = duplicate
            .spec
            .iter()
            .flat_map(|spec| spec.template.spec.iter())
            .flat_map(|pod| pod.containers.iter())
            .flat_map(|container| container.env.iter().flatten())
            .collect();

        self.env_binding
            .entries()
            .iter()
            .map(|(env_name, column)| {
                all_envs
                    .iter()
                    .find(|env| env.name == *env_name)
                    .map(|env| (env_name.clone(), env.value.clone().unwrap_or_default()))
                    .ok_or_else(|| {
                        Error::duplicate(format!(
                            "env var {env_name} (column {column}) not found on duplicate"
                        ))
                    })
            })
            .collect()
    }

    fn build_duplicate(
        &self,
        template: &Deployment,
        suffix: &str,
        context: &Self::Context,
    ) -> Result<Deployment> {
        let mut duplicate = template.clone();
        duplicate.status = None;

        let mut annotations = template.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(DEPLOYMENT_ID_ANNOTATION.to_string(), suffix.to_string());
        annotations.insert(
            ORIGINAL_OBSERVED_GENERATION_ANNOTATION.to_string(),
            observed_generation(template),
        );

        // Fresh metadata: server-managed fields (resourceVersion, uid,
        // creationTimestamp, ownerReferences, managedFields) must not make
        // it onto the duplicate.
        duplicate.metadata = ObjectMeta {
            name: Some(self.duplicate_name(suffix)),
            namespace: template.metadata.namespace.clone(),
            annotations: Some(annotations),
            labels: strip_labels(template.metadata.labels.clone(), &self.exclude_labels),
            deletion_grace_period_seconds: template.metadata.deletion_grace_period_seconds,
            ..ObjectMeta::default()
        };

        if let Some(spec) = duplicate.spec.as_mut() {
            // The selector stays exactly as the template wrote it; the
            // operator owns selector/label compatibility under duplication.
            if let Some(pod_meta) = spec.template.metadata.as_mut() {
                pod_meta.labels = strip_labels(pod_meta.labels.take(), &self.exclude_labels);
            }

            if let Some(pod_spec) = spec.template.spec.as_mut() {
                for container in &mut pod_spec.containers {
                    for (name, value) in context {
                        replace_or_add_env(&mut container.env, name, value);
                    }
                }
            }
        }

        Ok(duplicate)
    }
}

/// The template's observed generation as a decimal string; absent status
/// reads as 0.
fn observed_generation(template: &Deployment) -> String {
    template
        .status
        .as_ref()
        .and_then(|status| status.observed_generation)
        .unwrap_or(0)
        .to_string()
}

fn strip_labels(
    labels: Option<BTreeMap<String, String>>,
    exclude: &[String],
) -> Option<BTreeMap<String, String>> {
    labels.map(|mut labels| {
        for key in exclude {
            labels.remove(key);
        }
        labels
    })
}

/// Remove any existing entry with the same name, then append. Appending
/// keeps binding order stable across all containers.
fn replace_or_add_env(envs: &mut Option<Vec<EnvVar>>, name: &str, value: &str) {
    let envs = envs.get_or_insert_with(Vec::new);
    envs.retain(|env| env.name != name);
    envs.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}
