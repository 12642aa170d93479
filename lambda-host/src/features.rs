//! Typed per-invocation property bag with lazy provider fallback.
//!
//! Kept deliberately reflection-free: the "type tag" is [`TypeId`], looked
//! up through [`std::any::Any`] downcasts, never through a runtime type
//! name or attribute scan.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// A lazily-invoked source of feature instances.
///
/// Providers are consulted in registration order the first time a type is
/// requested and not already present; the first provider that returns
/// `Some` wins and its result is cached for the rest of the invocation.
pub trait FeatureProvider: Send + Sync {
    /// Attempts to produce an instance of the type identified by `type_id`.
    /// Implementations typically match on `type_id` against one or a small
    /// number of types they know how to build.
    fn try_create(&self, type_id: TypeId) -> Option<Box<dyn Any + Send>>;
}

impl<F> FeatureProvider for F
where
    F: Fn(TypeId) -> Option<Box<dyn Any + Send>> + Send + Sync,
{
    fn try_create(&self, type_id: TypeId) -> Option<Box<dyn Any + Send>> {
        self(type_id)
    }
}

/// Builds a [`FeatureCollection`] for each invocation from a process-wide
/// provider list, optionally extended with per-invocation providers.
#[derive(Clone, Default)]
pub struct FeatureCollectionFactory {
    providers: Arc<Vec<Arc<dyn FeatureProvider>>>,
}

impl fmt::Debug for FeatureCollectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureCollectionFactory")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl FeatureCollectionFactory {
    /// Creates a factory from a process-wide provider list. Earlier entries
    /// take priority over later ones.
    pub fn new(providers: Vec<Arc<dyn FeatureProvider>>) -> Self {
        Self {
            providers: Arc::new(providers),
        }
    }

    /// Produces a collection for one invocation. `extra` providers are
    /// appended after the process-wide ones, so process-wide providers
    /// always take priority.
    pub fn create(&self, extra: Vec<Arc<dyn FeatureProvider>>) -> FeatureCollection {
        let mut providers = (*self.providers).clone();
        providers.extend(extra);
        FeatureCollection {
            values: HashMap::new(),
            providers,
        }
    }
}

/// Per-invocation typed property bag.
pub struct FeatureCollection {
    values: HashMap<TypeId, Box<dyn Any + Send>>,
    providers: Vec<Arc<dyn FeatureProvider>>,
}

impl fmt::Debug for FeatureCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureCollection")
            .field("installed", &self.values.len())
            .finish()
    }
}

impl FeatureCollection {
    /// Returns the feature of type `T`, materializing it from a provider on
    /// first access if necessary.
    pub fn get<T: Send + 'static>(&mut self) -> Option<&T> {
        self.ensure(TypeId::of::<T>());
        self.values.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns a mutable reference to the feature of type `T`, materializing
    /// it from a provider on first access if necessary.
    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.ensure(TypeId::of::<T>());
        self.values.get_mut(&TypeId::of::<T>()).and_then(|v| v.downcast_mut::<T>())
    }

    /// Returns `(true, Some(value))` if present or materializable, else
    /// `(false, None)`.
    pub fn try_get<T: Send + 'static>(&mut self) -> (bool, Option<&T>) {
        let present = self.ensure(TypeId::of::<T>());
        (present, self.values.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>()))
    }

    /// Returns the feature of type `T` or [`MissingFeature`] if no stored
    /// value or provider can produce it.
    pub fn get_required<T: Send + 'static>(&mut self) -> Result<&T, MissingFeature> {
        self.get::<T>().ok_or(MissingFeature {
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Installs or replaces the stored value for `T`.
    pub fn set<T: Send + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Removes and returns the stored value for `T`, if any, without
    /// consulting providers. Used for features that aren't `Clone` (a
    /// streaming response body, for instance) and are only ever consumed
    /// once.
    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        let boxed = self.values.remove(&TypeId::of::<T>())?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    /// Ensures an entry for `type_id` is present, consulting providers in
    /// order if it is not. Returns whether an entry ended up present.
    fn ensure(&mut self, type_id: TypeId) -> bool {
        if self.values.contains_key(&type_id) {
            return true;
        }
        for provider in &self.providers {
            if let Some(instance) = provider.try_create(type_id) {
                self.values.insert(type_id, instance);
                return true;
            }
        }
        false
    }
}

/// Raised by [`FeatureCollection::get_required`] when no stored value or
/// provider can produce the requested type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no feature of type `{type_name}` is installed and no provider could create one")]
pub struct MissingFeature {
    type_name: &'static str,
}
