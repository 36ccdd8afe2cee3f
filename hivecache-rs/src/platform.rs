//! Provides a tiny DI like container which keeps all central components of a node.
//!
//! The platform is essentially a type-indexed map of **Arc<T>** instances along with the
//! central **is_running** flag which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked.
//!
//! In the common case [Platform::require](Platform::require) is the way to fetch a service
//! which is known to be there. Be aware however, that once the shutdown is initiated, the
//! internal map is cleared (so that all Drop handlers run). Code which might still execute
//! after [Platform::terminate](Platform::terminate) should therefore use
//! [Platform::find](Platform::find) and gracefully handle the **None** case.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use hivecache::platform::Platform;
//! struct Service {
//!     value: i32
//! }
//!
//! let platform = Platform::new();
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//! assert_eq!(platform.require::<Service>().value, 42);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated, all services are released and the platform reports itself
//! // as halted...
//! platform.terminate();
//! assert_eq!(platform.find::<Service>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Provides a container to keep all central services of a node in a single place.
///
/// Lookups vastly outnumber registrations (which basically all happen during startup),
/// therefore the internal map sits behind a read-write lock.
pub struct Platform {
    services: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: RwLock::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a new component.
    ///
    /// Registering a second component of the same type replaces the first one.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .write()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// Returns an empty optional if the service is unknown or if the platform is already
    /// shutting down.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let services = self.services.read().unwrap();
        services
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered service.
    ///
    /// # Panics
    /// Panics if the requested service isn't available. Note that this is also the case for
    /// every service once [Platform::terminate](Platform::terminate) has been invoked.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(service) => service,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services (so that their Drop handlers run eventually)
    /// and toggle the [is_running()](Platform::is_running) flag to **false**.
    pub fn terminate(&self) {
        // Drop all services so that the Drop handlers run (sooner or later)...
        self.services.write().unwrap().clear();

        // Mark the platform as halted...
        self.is_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::Platform;
    use std::sync::Arc;

    struct Service {
        value: i32,
    }

    struct UnknownService;

    #[test]
    fn services_can_be_registered_and_resolved() {
        let platform = Platform::new();
        platform.register::<Service>(Arc::new(Service { value: 42 }));

        assert_eq!(platform.require::<Service>().value, 42);
        assert_eq!(platform.find::<UnknownService>().is_none(), true);
    }

    #[test]
    fn terminate_releases_all_services() {
        let platform = Platform::new();
        platform.register::<Service>(Arc::new(Service { value: 42 }));

        assert_eq!(platform.is_running(), true);
        platform.terminate();

        assert_eq!(platform.find::<Service>().is_none(), true);
        assert_eq!(platform.is_running(), false);
    }
}
