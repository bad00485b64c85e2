//! Name-to-handler registries for orchestrations and activities
//!
//! Handlers are registered explicitly at startup through a builder and looked up
//! by declarative name at run time. There is no runtime type scanning: the
//! closure registered under a name owns (captures) whatever service instance it
//! needs, so `resolve(name)` yields both the callable and its owner.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::{ActivityContext, Error, OrchestrationContext};
use std::collections::HashMap;
use std::sync::Arc;

/// Generic registry shared by orchestrations and activities.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

/// Generic registry builder
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

// ============================================================================
// Generic Registry Implementation
// ============================================================================

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    /// Look up the handler registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<H>> {
        let result = self.inner.get(name).cloned();
        if result.is_none() {
            self.log_registry_miss(name);
        }
        result
    }

    /// List all registered names
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "duroxide_sim::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

// ============================================================================
// Generic Builder Implementation
// ============================================================================

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors (duplicates).
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// Merge another registry into this builder
    pub fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {error_prefix} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn register_all_handlers<F>(self, items: Vec<(&str, F)>, register_fn: impl Fn(Self, &str, F) -> Self) -> Self {
        items
            .into_iter()
            .fold(self, |builder, (name, f)| register_fn(builder, name, f))
    }

    /// Insert unless the name is already taken; duplicates are collected for `build_result`.
    fn insert_handler(mut self, name: String, handler: Arc<H>, error_prefix: &str) -> Self {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }
}

// ============================================================================
// Orchestration Builder - Specialized Methods
// ============================================================================

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::Result<String>> + Send + 'static,
    {
        self.insert_handler(name.into(), Arc::new(FnOrchestration(f)), "orchestration")
    }

    /// Register an orchestration whose input and output are serialized through the JSON codec.
    /// Input that does not decode fails the run with `TypeMismatch`.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = crate::Result<Out>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s).map_err(Error::type_mismatch)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out).map_err(Error::type_mismatch)
            }
        };
        self.insert_handler(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration")
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn register_all<F, Fut>(self, items: Vec<(&str, F)>) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::Result<String>> + Send + 'static,
    {
        self.register_all_handlers(items, |builder, name, f| builder.register(name, f))
    }
}

// ============================================================================
// Activity Builder - Specialized Methods
// ============================================================================

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_handler(name.into(), Arc::new(FnActivity(f)), "activity")
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
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert_handler(name.into(), Arc::new(FnActivity(wrapper)), "activity")
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }

    pub fn register_all<F, Fut>(self, items: Vec<(&str, F)>) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_all_handlers(items, |builder, name, f| builder.register(name, f))
    }
}
