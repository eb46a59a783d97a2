//! VerticalPodAutoscaler duplication
//!
//! VPAs are an external CRD, so they are handled through the dynamic API.
//! The adapter rewrites `spec.targetRef.name` so each duplicate VPA points
//! at the matching duplicate Deployment. There is no generation tracking:
//! every template change replaces every duplicate.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

#[cfg(test)]
use mockall::automock;

use crate::controller::engine::KindAdapter;
use crate::controller::VPA_ID_ANNOTATION;
use crate::error::{Error, Result};
use crate::tablewatch::Row;

/// The VerticalPodAutoscaler API as served by the autoscaler CRDs.
pub fn vpa_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "autoscaling.k8s.io",
        "v1",
        "VerticalPodAutoscaler",
    ))
}

/// Cluster-side CRUD over VPAs in the template's namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VpaStore: Send + Sync {
    /// Get by name; `None` on NotFound.
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>>;

    /// All VPAs in the namespace.
    async fn list(&self) -> Result<Vec<DynamicObject>>;

    async fn create(&self, vpa: &DynamicObject) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`VpaStore`] backed by the Kubernetes dynamic API.
pub struct KubeVpaStore {
    api: Api<DynamicObject>,
}

impl KubeVpaStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced_with(client, namespace, &vpa_resource()),
        }
    }
}

#[async_trait]
impl VpaStore for KubeVpaStore {
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>> {
        match self.api.get(name).await {
            Ok(vpa) => Ok(Some(vpa)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<DynamicObject>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, vpa: &DynamicObject) -> Result<()> {
        self.api.create(&PostParams::default(), vpa).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Kind adapter for VPA duplication.
pub struct VpaAdapter<S> {
    store: S,
    template_name: String,
    /// Template Deployment name; duplicate VPAs target `<this>-<suffix>`.
    deployment_name: String,
}

impl<S> VpaAdapter<S> {
    pub fn new(
        store: S,
        template_name: impl Into<String>,
        deployment_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            template_name: template_name.into(),
            deployment_name: deployment_name.into(),
        }
    }
}

#[async_trait]
impl<S: VpaStore> KindAdapter for VpaAdapter<S> {
    type Object = DynamicObject;
    type Context = ();

    fn kind(&self) -> &'static str {
        "vpa"
    }

    fn id_annotation(&self) -> &'static str {
        VPA_ID_ANNOTATION
    }

    fn duplicate_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.template_name, suffix)
    }

    async fn fetch_template(&self) -> Result<Option<DynamicObject>> {
        self.store.get(&self.template_name).await
    }

    async fn get(&self, name: &str) -> Result<Option<DynamicObject>> {
        self.store.get(name).await
    }

    async fn list(&self) -> Result<Vec<DynamicObject>> {
        self.store.list().await
    }

    async fn create(&self, object: &DynamicObject) -> Result<()> {
        self.store.create(object).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(name).await
    }

    fn metadata<'a>(&self, object: &'a DynamicObject) -> &'a ObjectMeta {
        &object.metadata
    }

    /// No staleness tracking for VPAs: every change replaces every duplicate.
    fn needs_replace(&self, _template: &DynamicObject, _duplicate: &DynamicObject) -> Result<bool> {
        Ok(true)
    }

    fn context_from_row(&self, _row: &Row) -> Result<()> {
        Ok(())
    }

    fn context_from_duplicate(&self, _duplicate: &DynamicObject) -> Result<()> {
        Ok(())
    }

    fn build_duplicate(
        &self,
        template: &DynamicObject,
        suffix: &str,
        _context: &(),
    ) -> Result<DynamicObject> {
        let mut duplicate = template.clone();

        let mut annotations = template.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(VPA_ID_ANNOTATION.to_string(), suffix.to_string());

        duplicate.metadata = ObjectMeta {
            name: Some(self.duplicate_name(suffix)),
            namespace: template.metadata.namespace.clone(),
            annotations: Some(annotations),
            labels: template.metadata.labels.clone(),
            deletion_grace_period_seconds: template.metadata.deletion_grace_period_seconds,
            ..ObjectMeta::default()
        };

        if let Some(data) = duplicate.data.as_object_mut() {
            data.remove("status");
        }

        let target_name = format!("{}-{}", self.deployment_name, suffix);
        let target_ref = duplicate
            .data
            .get_mut("spec")
            .and_then(|spec| spec.get_mut("targetRef"))
            .and_then(|target| target.as_object_mut())
            .ok_or_else(|| Error::duplicate("vpa template has no spec.targetRef"))?;
        target_ref.insert(
            "name".to_string(),
            serde_json::Value::String(target_name),
        );

        Ok(duplicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;
    use serde_json::json;

    fn vpa(name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "autoscaling.k8s.io/v1".to_string(),
                kind: "VerticalPodAutoscaler".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("n".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            data: json!({
                "spec": {
                    "targetRef": {
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "name": "t",
                    },
                    "updatePolicy": { "updateMode": "Auto" },
                },
                "status": { "conditions": [] },
            }),
        }
    }

    fn adapter() -> VpaAdapter<MockVpaStore> {
        VpaAdapter::new(MockVpaStore::new(), "v", "t")
    }

    #[test]
    fn duplicate_targets_the_duplicate_deployment() {
        let duplicate = adapter().build_duplicate(&vpa("v"), "a", &()).unwrap();

        assert_eq!(duplicate.metadata.name.as_deref(), Some("v-a"));
        assert_eq!(duplicate.metadata.namespace.as_deref(), Some("n"));
        assert_eq!(
            duplicate.data["spec"]["targetRef"]["name"],
            json!("t-a")
        );
        // Everything else about the target ref survives.
        assert_eq!(duplicate.data["spec"]["targetRef"]["kind"], json!("Deployment"));
        assert_eq!(duplicate.data["spec"]["updatePolicy"]["updateMode"], json!("Auto"));
    }

    #[test]
    fn duplicate_carries_id_annotation_and_no_status() {
        let duplicate = adapter().build_duplicate(&vpa("v"), "a", &()).unwrap();

        let annotations = duplicate.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(VPA_ID_ANNOTATION), Some(&"a".to_string()));

        assert!(duplicate.metadata.resource_version.is_none());
        assert!(duplicate.data.get("status").is_none());
    }

    #[test]
    fn missing_target_ref_is_an_error() {
        let mut template = vpa("v");
        template.data = json!({ "spec": {} });

        let err = adapter().build_duplicate(&template, "a", &()).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn replacement_is_unconditional() {
        let adapter = adapter();
        assert!(adapter.needs_replace(&vpa("v"), &vpa("v-a")).unwrap());
    }

    #[test]
    fn vpa_resource_points_at_autoscaler_group() {
        let resource = vpa_resource();
        assert_eq!(resource.group, "autoscaling.k8s.io");
        assert_eq!(resource.version, "v1");
        assert_eq!(resource.kind, "VerticalPodAutoscaler");
    }
}
