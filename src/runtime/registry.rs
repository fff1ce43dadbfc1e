//! Versioned handler registries.
//!
//! One generic [`Registry<H>`] stores workflow and activity handlers. Workflows
//! register under semver versions and resolve through a [`VersionPolicy`];
//! activities live at a single fixed version and always resolve to it.

use super::{ActivityHandler, FnActivity, FnWorkflow, WorkflowHandler};
use crate::_typed_codec::{Codec, Json};
use crate::WorkflowContext;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Version used for activities and for workflows registered without one.
const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// How a new run picks the workflow version when the start request names none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Start a builder pre-populated with this registry's handlers and policies.
    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            policy: reg.policies().clone(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a handler through the name's version policy (`Latest` if unset).
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);

        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    pub fn resolve_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    /// Change the policy for new runs. Runs already pinned are unaffected.
    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "duraflow::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Build, logging (not failing on) registration errors.
    pub fn build(self) -> Registry<H> {
        for error in &self.errors {
            tracing::warn!(target: "duraflow::runtime::registry", %error, "registration error ignored");
        }
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build the registry, returning every registration error if there were any.
    ///
    /// # Errors
    ///
    /// Returns the joined registration errors (duplicates, bad versions).
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn merge_registry(mut self, other: Registry<H>, kind: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions.iter() {
                if entry.contains_key(version) {
                    self.errors.push(format!("duplicate {kind} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), handler.clone());
                }
            }
        }
        self
    }

    fn check_duplicate(&mut self, name: &str, version: &Version, kind: &str) -> bool {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(version) {
            self.errors.push(format!("duplicate {kind} registration: {name}@{version}"));
            true
        } else {
            false
        }
    }

    /// Parse `version` and check it is later than everything registered for `name`.
    fn check_versioned(&mut self, name: &str, version: &str) -> Option<Version> {
        let v = match Version::parse(version) {
            Ok(v) => v,
            Err(e) => {
                self.errors.push(format!("invalid version for {name}: {version}: {e}"));
                return None;
            }
        };
        if self.check_duplicate(name, &v, "workflow") {
            return None;
        }
        if let Some((latest, _)) = self.map.get(name).and_then(|m| m.iter().next_back())
            && &v <= latest
        {
            self.errors
                .push(format!("non-monotonic workflow version for {name}: {v} is not later than {latest}"));
            return None;
        }
        Some(v)
    }
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, "1.0.0", f)
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_versioned_typed(name, "1.0.0", f)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if let Some(v) = self.check_versioned(&name, version.as_ref()) {
            self.map.entry(name).or_default().insert(v, Arc::new(FnWorkflow(f)));
        }
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: WorkflowContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.register_versioned(name, version, wrapper)
    }

    pub fn merge(self, other: WorkflowRegistry) -> Self {
        self.merge_registry(other, "workflow")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self.check_duplicate(&name, &DEFAULT_VERSION, "activity") {
            return self;
        }
        self.map
            .entry(name.clone())
            .or_default()
            .insert(DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(crate::ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: crate::ActivityContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

impl ActivityRegistry {
    /// Activities have a single version; this is the lookup workers use.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.resolve_handler(name).map(|(_, h)| h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_workflow() -> WorkflowRegistryBuilder {
        WorkflowRegistry::builder()
    }

    #[test]
    fn latest_policy_picks_highest_version() {
        let reg = noop_workflow()
            .register("order", |_ctx, input| async move { Ok(input) })
            .register_versioned("order", "2.0.0", |_ctx, input| async move { Ok(input) })
            .build();
        let (v, _) = reg.resolve_handler("order").unwrap();
        assert_eq!(v, Version::new(2, 0, 0));
        assert_eq!(reg.list_versions("order").len(), 2);
    }

    #[test]
    fn exact_policy_can_be_changed_at_runtime() {
        let reg = noop_workflow()
            .register("order", |_ctx, input| async move { Ok(input) })
            .register_versioned("order", "1.1.0", |_ctx, input| async move { Ok(input) })
            .set_policy("order", VersionPolicy::Exact(Version::new(1, 0, 0)))
            .build();
        assert_eq!(reg.resolve_handler("order").unwrap().0, Version::new(1, 0, 0));
        reg.set_version_policy("order", VersionPolicy::Latest);
        assert_eq!(reg.resolve_handler("order").unwrap().0, Version::new(1, 1, 0));
        assert!(reg.resolve_exact("order", &Version::new(3, 0, 0)).is_none());
    }

    #[test]
    fn registration_errors_are_collected() {
        let err = noop_workflow()
            .register("a", |_ctx, input| async move { Ok(input) })
            .register("a", |_ctx, input| async move { Ok(input) })
            .register_versioned("b", "not-semver", |_ctx, input| async move { Ok(input) })
            .register_versioned("c", "2.0.0", |_ctx, input| async move { Ok(input) })
            .register_versioned("c", "1.5.0", |_ctx, input| async move { Ok(input) })
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate workflow registration: a@1.0.0"));
        assert!(err.contains("invalid version for b"));
        assert!(err.contains("non-monotonic workflow version for c"));
    }

    #[test]
    fn activities_resolve_by_name() {
        let reg = ActivityRegistry::builder()
            .register("charge", |_ctx, input| async move { Ok(input) })
            .build();
        assert!(reg.get("charge").is_some());
        assert!(reg.get("refund").is_none());
        assert!(reg.has("charge"));
        assert_eq!(reg.count(), 1);

        let merged = ActivityRegistry::builder_from(&reg)
            .merge(reg.clone())
            .build_result();
        assert!(merged.is_err());
    }
}
