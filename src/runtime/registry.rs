//! Generic versioned registry for orchestrations and activities
//!
//! Orchestrations are registered under a semver version and new instances pick
//! a version through the name's [`VersionPolicy`]. Replays always resolve the
//! exact version recorded on `OrchestratorStarted`. Activities are stored at
//! 1.0.0 and always resolved as latest.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{ActivityContext, OrchestrationContext};
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Default version for activities and default orchestration registrations
const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
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

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Resolve the handler new instances of `name` should start on.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self
            .policy
            .lock()
            // Mutex lock should never fail in normal operation - if poisoned, it indicates a serious bug
            .expect("Mutex should not be poisoned")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);

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

    /// Resolve handler for exact version
    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v)).cloned();
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(name.to_string(), policy);
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

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "durable_pizza::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions_for_name = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors if any handlers failed to register.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, error_prefix: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}@{version}"));
            return;
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                self.errors.push(format!(
                    "non-monotonic {error_prefix} version for {name}: {version} is not later than {latest}"
                ));
                return;
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler_versioned(name, DEFAULT_VERSION.to_string(), Arc::new(FnOrchestration(f)))
    }

    pub fn register_versioned<F, Fut>(self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler_versioned(name, version, Arc::new(FnOrchestration(f)))
    }

    /// Register an orchestration with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    /// Register a handler object at the default version. Use this for handlers
    /// that override [`OrchestrationHandler::validate_input`].
    pub fn register_handler(self, name: impl Into<String>, handler: Arc<dyn OrchestrationHandler>) -> Self {
        self.register_handler_versioned(name, DEFAULT_VERSION.to_string(), handler)
    }

    pub fn register_handler_versioned(
        mut self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        handler: Arc<dyn OrchestrationHandler>,
    ) -> Self {
        let name = name.into();
        match Version::parse(version.as_ref()) {
            Ok(v) => self.insert(name, v, handler, "orchestration"),
            Err(e) => self
                .errors
                .push(format!("invalid version '{}' for orchestration {name}: {e}", version.as_ref())),
        }
        self
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert(name.clone(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                crate::_typed_codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(_ctx: OrchestrationContext, input: String) -> Result<String, String> {
        Ok(input)
    }

    #[test]
    fn latest_and_exact_resolution() {
        let reg = OrchestrationRegistry::builder()
            .register("Echo", echo)
            .register_versioned("Echo", "2.0.0", echo)
            .build();
        let (v, _) = reg.resolve_handler("Echo").expect("registered");
        assert_eq!(v, Version::new(2, 0, 0));
        assert!(reg.resolve_handler_exact("Echo", &Version::new(1, 0, 0)).is_some());
        assert!(reg.resolve_handler_exact("Echo", &Version::new(3, 0, 0)).is_none());

        reg.set_version_policy("Echo", VersionPolicy::Exact(Version::new(1, 0, 0)));
        assert_eq!(reg.resolve_handler("Echo").map(|(v, _)| v), Some(Version::new(1, 0, 0)));
    }

    #[test]
    fn builder_policy_pins_new_instances() {
        let reg = OrchestrationRegistry::builder()
            .register("Echo", echo)
            .register_versioned("Echo", "2.0.0", echo)
            .set_policy("Echo", VersionPolicy::Exact(Version::new(1, 0, 0)))
            .build();
        assert_eq!(reg.resolve_handler("Echo").map(|(v, _)| v), Some(Version::new(1, 0, 0)));

        let missing = OrchestrationRegistry::builder()
            .register("Echo", echo)
            .set_policy("Echo", VersionPolicy::Exact(Version::new(9, 0, 0)))
            .build();
        assert!(missing.resolve_handler("Echo").is_none());
    }

    #[test]
    fn registration_errors_are_collected() {
        let err = OrchestrationRegistry::builder()
            .register("Echo", echo)
            .register("Echo", echo)
            .register_versioned("Echo", "not-semver", echo)
            .build_result()
            .err()
            .expect("errors expected");
        assert!(err.contains("duplicate orchestration registration: Echo@1.0.0"), "{err}");
        assert!(err.contains("invalid version"), "{err}");
    }

    #[test]
    fn non_monotonic_versions_rejected() {
        let err = OrchestrationRegistry::builder()
            .register_versioned("Echo", "2.0.0", echo)
            .register_versioned("Echo", "1.5.0", echo)
            .build_result()
            .err()
            .expect("errors expected");
        assert!(err.contains("non-monotonic"), "{err}");
    }
}
