//! Generic duplicate reconciliation engine
//!
//! Both duplicated kinds share one state machine per suffix: a duplicate is
//! created on first observation of its row, replaced (delete then create)
//! when the template changes, and deleted on template deletion or cleaner
//! removal. The engine implements that machine; a [`KindAdapter`] supplies
//! everything kind-specific. Per-row and per-duplicate failures are logged
//! and skipped; convergence is restored by the next row or template event.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::tablewatch::Row;

/// Kind-specific behavior plugged into [`DuplicateEngine`].
#[async_trait]
pub trait KindAdapter: Send + Sync {
    /// Cluster object this adapter duplicates.
    type Object: Clone + Send + Sync;

    /// Per-duplicate state recovered from a row or from a live duplicate
    /// and applied during construction (the env values for Deployments,
    /// nothing for VPAs).
    type Context: Send + Sync;

    /// Kind label used in logs.
    fn kind(&self) -> &'static str;

    /// Annotation whose presence marks an object as a duplicate.
    fn id_annotation(&self) -> &'static str;

    /// Name of the duplicate carrying the given suffix.
    fn duplicate_name(&self, suffix: &str) -> String;

    /// Fetch the template object; `None` when it does not currently exist.
    async fn fetch_template(&self) -> Result<Option<Self::Object>>;

    /// Get one object by name; `None` on NotFound.
    async fn get(&self, name: &str) -> Result<Option<Self::Object>>;

    /// Raw namespace listing; the engine applies the annotation filter.
    async fn list(&self) -> Result<Vec<Self::Object>>;

    async fn create(&self, object: &Self::Object) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    fn metadata<'a>(&self, object: &'a Self::Object) -> &'a ObjectMeta;

    /// Whether the duplicate is stale relative to the changed template.
    fn needs_replace(&self, template: &Self::Object, duplicate: &Self::Object) -> Result<bool>;

    fn context_from_row(&self, row: &Row) -> Result<Self::Context>;

    /// Recover the construction context from the live duplicate itself.
    fn context_from_duplicate(&self, duplicate: &Self::Object) -> Result<Self::Context>;

    fn build_duplicate(
        &self,
        template: &Self::Object,
        suffix: &str,
        context: &Self::Context,
    ) -> Result<Self::Object>;
}

/// The shared reconciliation core, parameterized by kind.
pub struct DuplicateEngine<A: KindAdapter> {
    adapter: A,
    suffix_column: String,
}

impl<A: KindAdapter> DuplicateEngine<A> {
    pub fn new(adapter: A, suffix_column: impl Into<String>) -> Self {
        Self {
            adapter,
            suffix_column: suffix_column.into(),
        }
    }

    /// Ensure exactly one duplicate exists for the row's suffix. Idempotent
    /// when the duplicate is already present; any per-row failure is logged
    /// and skipped without creating a partial duplicate.
    pub async fn on_row(&self, row: &Row) {
        let suffix = match row.get(&self.suffix_column) {
            Some(suffix) if !suffix.is_empty() => suffix,
            _ => {
                warn!(
                    kind = self.adapter.kind(),
                    column = %self.suffix_column,
                    "suffix column missing or empty on row"
                );
                return;
            }
        };

        match self.adapter.get(&self.adapter.duplicate_name(suffix)).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to check for existing duplicate"
                );
                return;
            }
        }

        let context = match self.adapter.context_from_row(row) {
            Ok(context) => context,
            Err(e) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to build creation context from row"
                );
                return;
            }
        };

        self.create_duplicate(suffix, &context).await;
    }

    /// Replace every duplicate the adapter judges stale against the changed
    /// template. Each duplicate's context is recovered from the duplicate
    /// itself before deletion-then-recreation; a recovery failure leaves
    /// that duplicate deleted and is logged.
    pub async fn on_template_changed(&self, template: &A::Object) -> Result<()> {
        let duplicates = self.list_duplicates().await?;

        info!(
            kind = self.adapter.kind(),
            count = duplicates.len(),
            "template changed, updating duplicates"
        );

        for duplicate in &duplicates {
            match self.adapter.needs_replace(template, duplicate) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(
                        kind = self.adapter.kind(),
                        error = %e,
                        "unable to judge duplicate staleness"
                    );
                    continue;
                }
            }

            let Some(name) = self.adapter.metadata(duplicate).name.clone() else {
                continue;
            };

            if let Err(e) = self.adapter.delete(&name).await {
                if !e.is_not_found() {
                    error!(
                        kind = self.adapter.kind(),
                        name = %name,
                        error = %e,
                        "unable to remove duplicate"
                    );
                    continue;
                }
            }

            let Some(suffix) = self.suffix_of(duplicate) else {
                error!(
                    kind = self.adapter.kind(),
                    name = %name, "no suffix annotation on duplicate"
                );
                continue;
            };

            let context = match self.adapter.context_from_duplicate(duplicate) {
                Ok(context) => context,
                Err(e) => {
                    error!(
                        kind = self.adapter.kind(),
                        suffix = %suffix,
                        error = %e,
                        "unable to recover context from duplicate"
                    );
                    continue;
                }
            };

            self.create_duplicate(&suffix, &context).await;
        }

        Ok(())
    }

    /// Delete every duplicate. Per-object failures do not halt the fan-out.
    pub async fn on_template_deleted(&self) -> Result<()> {
        let duplicates = self.list_duplicates().await?;

        info!(
            kind = self.adapter.kind(),
            count = duplicates.len(),
            "template deleted, removing duplicates"
        );

        for duplicate in &duplicates {
            let Some(name) = self.adapter.metadata(duplicate).name.clone() else {
                continue;
            };

            if let Err(e) = self.adapter.delete(&name).await {
                if !e.is_not_found() {
                    error!(
                        kind = self.adapter.kind(),
                        name = %name,
                        error = %e,
                        "error removing duplicate"
                    );
                }
            }
        }

        Ok(())
    }

    /// Delete the duplicate for a stale suffix, if it exists. Safe to call
    /// repeatedly for the same suffix.
    pub async fn on_removal(&self, suffix: &str) {
        let name = self.adapter.duplicate_name(suffix);

        match self.adapter.get(&name).await {
            Ok(Some(_)) => {
                info!(kind = self.adapter.kind(), suffix = %suffix, "removing stale duplicate");
                if let Err(e) = self.adapter.delete(&name).await {
                    if !e.is_not_found() {
                        error!(
                            kind = self.adapter.kind(),
                            name = %name,
                            error = %e,
                            "unable to remove stale duplicate"
                        );
                    }
                }
            }
            Ok(None) => {
                debug!(kind = self.adapter.kind(), suffix = %suffix, "stale duplicate already gone");
            }
            Err(e) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to check stale duplicate"
                );
            }
        }
    }

    /// Classify a template event by re-fetching: present drives the
    /// change path, absent the deletion fan-out.
    pub async fn reconcile_template(&self) -> Result<()> {
        match self.adapter.fetch_template().await? {
            Some(template) => self.on_template_changed(&template).await,
            None => self.on_template_deleted().await,
        }
    }

    async fn create_duplicate(&self, suffix: &str, context: &A::Context) {
        info!(kind = self.adapter.kind(), suffix = %suffix, "creating duplicate");

        let template = match self.adapter.fetch_template().await {
            Ok(Some(template)) => template,
            Ok(None) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix, "template not found, skipping duplicate creation"
                );
                return;
            }
            Err(e) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to get template"
                );
                return;
            }
        };

        let duplicate = match self.adapter.build_duplicate(&template, suffix, context) {
            Ok(duplicate) => duplicate,
            Err(e) => {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to build duplicate"
                );
                return;
            }
        };

        if let Err(e) = self.adapter.create(&duplicate).await {
            if e.is_already_exists() {
                debug!(kind = self.adapter.kind(), suffix = %suffix, "duplicate already exists");
            } else {
                error!(
                    kind = self.adapter.kind(),
                    suffix = %suffix,
                    error = %e,
                    "unable to create duplicate"
                );
            }
        }
    }

    /// Namespace listing narrowed to objects carrying the id annotation.
    async fn list_duplicates(&self) -> Result<Vec<A::Object>> {
        let objects = self.adapter.list().await.map_err(|e| {
            error!(
                kind = self.adapter.kind(),
                error = %e,
                "error listing duplicates"
            );
            e
        })?;

        Ok(objects
            .into_iter()
            .filter(|object| {
                self.adapter
                    .metadata(object)
                    .annotations
                    .as_ref()
                    .is_some_and(|annotations| {
                        annotations.contains_key(self.adapter.id_annotation())
                    })
            })
            .collect())
    }

    fn suffix_of(&self, object: &A::Object) -> Option<String> {
        self.adapter
            .metadata(object)
            .annotations
            .as_ref()?
            .get(self.adapter.id_annotation())
            .cloned()
    }
}
