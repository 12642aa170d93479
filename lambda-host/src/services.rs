//! Minimal dependency-resolution port.
//!
//! Not a general-purpose DI container: registration is explicit and
//! type-tag based (no reflection), matching the Handler Composer's
//! implicit `Option<S>` service resolution and mandatory
//! `.keyed_service(key)` combinator in [`crate::composer`].

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::Arc,
};

/// A constant usable to disambiguate multiple registrations of the same
/// type, e.g. two named database connections.
pub trait ServiceKey: fmt::Debug + Send + Sync + 'static {
    /// Returns a value equal for equal keys, used as the map key alongside
    /// the requested type.
    fn key_hash(&self) -> u64;
}

impl<T> ServiceKey for T
where
    T: fmt::Debug + Hash + Eq + Send + Sync + 'static,
{
    fn key_hash(&self) -> u64 {
        use std::hash::Hasher;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

type RegistrationKey = (TypeId, Option<u64>);

/// A factory invoked once per scope to produce a service instance.
type Factory = Arc<dyn Fn(&ServiceScope) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Process-wide registry of service factories, scoped lifetimes resolved
/// per invocation via [`ServiceScope`].
#[derive(Clone, Default)]
pub struct ServiceProvider {
    singletons: Arc<HashMap<RegistrationKey, Arc<dyn Any + Send + Sync>>>,
    scoped_factories: Arc<HashMap<RegistrationKey, Factory>>,
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("singletons", &self.singletons.len())
            .field("scoped_factories", &self.scoped_factories.len())
            .finish()
    }
}

/// Builds a [`ServiceProvider`] from explicit registrations.
#[derive(Default)]
pub struct ServiceProviderBuilder {
    singletons: HashMap<RegistrationKey, Arc<dyn Any + Send + Sync>>,
    scoped_factories: HashMap<RegistrationKey, Factory>,
}

impl ServiceProviderBuilder {
    /// Registers a process-wide singleton, resolved without a scope.
    pub fn singleton<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.singletons.insert((TypeId::of::<T>(), None), Arc::new(value));
        self
    }

    /// Registers a keyed process-wide singleton.
    pub fn keyed_singleton<T: Send + Sync + 'static>(mut self, key: impl ServiceKey, value: T) -> Self {
        self.singletons
            .insert((TypeId::of::<T>(), Some(key.key_hash())), Arc::new(value));
        self
    }

    /// Registers a factory invoked once per [`ServiceScope`], i.e. once per
    /// invocation.
    pub fn scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        self.scoped_factories.insert(
            (TypeId::of::<T>(), None),
            Arc::new(move |scope| Box::new(factory(scope))),
        );
        self
    }

    /// Registers a keyed scoped factory.
    pub fn keyed_scoped<T, F>(mut self, key: impl ServiceKey, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> T + Send + Sync + 'static,
    {
        self.scoped_factories.insert(
            (TypeId::of::<T>(), Some(key.key_hash())),
            Arc::new(move |scope| Box::new(factory(scope))),
        );
        self
    }

    /// Finalizes the registry.
    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            singletons: Arc::new(self.singletons),
            scoped_factories: Arc::new(self.scoped_factories),
        }
    }
}

impl ServiceProvider {
    /// Starts a builder.
    pub fn builder() -> ServiceProviderBuilder {
        ServiceProviderBuilder::default()
    }

    /// Opens a new scope. Scoped service instances are created lazily
    /// within the scope and live as long as it does.
    pub fn new_scope(&self) -> ServiceScope {
        ServiceScope {
            provider: self.clone(),
            instances: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}

/// A per-invocation resolution scope. Created at most once per
/// [`crate::context::LifecycleContext`] and disposed with it.
#[derive(Clone)]
pub struct ServiceScope {
    provider: ServiceProvider,
    instances: Arc<std::sync::Mutex<HashMap<RegistrationKey, Arc<dyn Any + Send + Sync>>>>,
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope").finish()
    }
}

impl ServiceScope {
    /// Resolves a service of type `T`, instantiating a scoped factory at
    /// most once per scope.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.resolve_inner(TypeId::of::<T>(), None)
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Resolves a keyed service of type `T`.
    pub fn resolve_keyed<T: Clone + Send + Sync + 'static>(&self, key: impl ServiceKey) -> Option<T> {
        self.resolve_inner(TypeId::of::<T>(), Some(key.key_hash()))
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Resolves a keyed service of type `T` from an already-hashed key,
    /// for callers (like [`crate::composer::HandlerBuilder`]) that compute
    /// the hash once at registration time rather than re-hashing the
    /// original key on every dispatch.
    pub fn resolve_keyed_by_hash<T: Clone + Send + Sync + 'static>(&self, key_hash: u64) -> Option<T> {
        self.resolve_inner(TypeId::of::<T>(), Some(key_hash))
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    fn resolve_inner(&self, type_id: TypeId, key: Option<u64>) -> Option<Arc<dyn Any + Send + Sync>> {
        let reg_key = (type_id, key);
        if let Some(singleton) = self.provider.singletons.get(&reg_key) {
            return Some(singleton.clone());
        }
        let mut instances = self.instances.lock().expect("service scope mutex poisoned");
        if let Some(existing) = instances.get(&reg_key) {
            return Some(existing.clone());
        }
        let factory = self.provider.scoped_factories.get(&reg_key)?;
        let instance: Arc<dyn Any + Send + Sync> = Arc::from(factory(self));
        instances.insert(reg_key, instance.clone());
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Greeter(String);

    #[test]
    fn scoped_factory_memoizes_within_a_scope() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let provider = ServiceProvider::builder()
            .scoped::<Greeter, _>(move |_| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Greeter("hi".into())
            })
            .build();
        let scope = provider.new_scope();
        assert_eq!(scope.resolve::<Greeter>(), Some(Greeter("hi".into())));
        assert_eq!(scope.resolve::<Greeter>(), Some(Greeter("hi".into())));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn two_scopes_get_independent_instances() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let provider = ServiceProvider::builder()
            .scoped::<Greeter, _>(move |_| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Greeter("hi".into())
            })
            .build();
        provider.new_scope().resolve::<Greeter>();
        provider.new_scope().resolve::<Greeter>();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn singleton_resolves_across_scopes() {
        let provider = ServiceProvider::builder().singleton(Greeter("shared".into())).build();
        assert_eq!(provider.new_scope().resolve::<Greeter>(), Some(Greeter("shared".into())));
        assert_eq!(provider.new_scope().resolve::<Greeter>(), Some(Greeter("shared".into())));
    }

    #[test]
    fn keyed_registration_resolves_independently() {
        let provider = ServiceProvider::builder()
            .keyed_scoped::<Greeter, _>("primary", |_| Greeter("primary".into()))
            .keyed_scoped::<Greeter, _>("secondary", |_| Greeter("secondary".into()))
            .build();
        let scope = provider.new_scope();
        assert_eq!(scope.resolve_keyed::<Greeter>("primary"), Some(Greeter("primary".into())));
        assert_eq!(scope.resolve_keyed::<Greeter>("secondary"), Some(Greeter("secondary".into())));
    }
}
