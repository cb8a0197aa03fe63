//! Service container: named factories with singleton or per-request
//! lifetimes, used to wire the pipeline's collaborators at startup.
//!
//! ```text
//! register(name, lifetime, deps, factory)   (startup, &mut self)
//!        │
//!        ▼
//! validate()   DFS over declared deps: unknown names, cycles
//! warm_up()    build every singleton in registration order
//!        │
//!        ▼
//! resolve::<T>(name)   (any thread, &self)
//! ```
//!
//! Services are stored type-erased and handed out by cloning, so `T` is
//! typically an `Arc<dyn Trait>` or `Arc<Concrete>`. Each singleton sits
//! behind its own mutex, which makes first construction happen exactly once
//! even when many requests race for it. A factory runs while that mutex is
//! held, so it may only resolve the dependencies it declared: `validate`
//! proves those acyclic, and anything else is refused at resolution time.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{RagError, Result};

/// Well-known service names used by the pipeline wiring.
pub mod names {
    pub const EMBEDDING_PROVIDER: &str = "embedding_provider";
    pub const EMBEDDING_CACHE: &str = "embedding_cache";
    pub const VECTOR_INDEX: &str = "vector_index";
    pub const GENERATION_PROVIDER: &str = "generation_provider";
    pub const TOKEN_COUNTER: &str = "token_counter";
    pub const CONVERSATIONS: &str = "conversations";
    pub const PROMPT_ASSEMBLER: &str = "prompt_assembler";
    pub const ORCHESTRATOR: &str = "generation_orchestrator";
    pub const SETTINGS: &str = "pipeline_settings";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Built once on first resolution, then shared.
    Singleton,
    /// Built fresh on every resolution.
    PerRequest,
}

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&Resolver<'_>) -> Result<Instance> + Send + Sync>;

struct Registration {
    name: String,
    lifetime: Lifetime,
    dependencies: Vec<String>,
    type_name: &'static str,
    factory: Factory,
    instance: Mutex<Option<Instance>>,
}

#[derive(Default)]
pub struct ServiceContainer {
    registrations: Vec<Registration>,
    by_name: HashMap<String, usize>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    ///
    /// `dependencies` lists the services the factory resolves; it is what
    /// [`validate`](Self::validate) checks. Registering a name twice is a
    /// configuration error.
    pub fn register<T, F>(
        &mut self,
        name: &str,
        lifetime: Lifetime,
        dependencies: &[&str],
        factory: F,
    ) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        if self.by_name.contains_key(name) {
            return Err(RagError::Configuration(format!(
                "service '{}' is already registered",
                name
            )));
        }
        self.by_name.insert(name.to_string(), self.registrations.len());
        self.registrations.push(Registration {
            name: name.to_string(),
            lifetime,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            type_name: type_name::<T>(),
            factory: Box::new(move |resolver| {
                factory(resolver).map(|service| Arc::new(service) as Instance)
            }),
            instance: Mutex::new(None),
        });
        Ok(())
    }

    /// Register an already-built value as a singleton with no dependencies.
    pub fn register_instance<T>(&mut self, name: &str, value: T) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register(name, Lifetime::Singleton, &[], move |_| Ok(value.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn lifetime(&self, name: &str) -> Option<Lifetime> {
        self.find(name).map(|r| r.lifetime)
    }

    pub fn resolve<T: Clone + 'static>(&self, name: &str) -> Result<T> {
        Resolver::new(self).resolve(name)
    }

    /// Check the declared dependency graph: every dependency is registered
    /// and there are no cycles.
    pub fn validate(&self) -> Result<()> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = Vec::new();
        for registration in &self.registrations {
            self.visit(&registration.name, &mut path, &mut done)?;
        }
        Ok(())
    }

    /// Validate, then build every singleton in registration order.
    pub fn warm_up(&self) -> Result<()> {
        self.validate()?;
        for registration in &self.registrations {
            if registration.lifetime == Lifetime::Singleton {
                Resolver::new(self).resolve_instance(&registration.name)?;
            }
        }
        debug!(services = self.registrations.len(), "Service container warmed up");
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Registration> {
        self.by_name.get(name).map(|&i| &self.registrations[i])
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|n| *n == name) {
            let mut chain: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
            chain.push(name.to_string());
            return Err(RagError::CircularDependency(chain));
        }
        let registration = self
            .find(name)
            .ok_or_else(|| RagError::UnregisteredService(name.to_string()))?;

        path.push(&registration.name);
        for dependency in &registration.dependencies {
            self.visit(dependency, path, done)?;
        }
        path.pop();
        done.insert(&registration.name);
        Ok(())
    }
}

/// Resolution context handed to factories.
///
/// Tracks the chain of services being built in the current call so a
/// dependency cycle fails with the full chain instead of recursing forever,
/// and so a factory cannot reach past its declared dependencies.
pub struct Resolver<'a> {
    container: &'a ServiceContainer,
    stack: RefCell<Vec<String>>,
}

impl<'a> Resolver<'a> {
    fn new(container: &'a ServiceContainer) -> Self {
        Self {
            container,
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn resolve<T: Clone + 'static>(&self, name: &str) -> Result<T> {
        let instance = self.resolve_instance(name)?;
        instance
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| RagError::ServiceType {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    fn resolve_instance(&self, name: &str) -> Result<Instance> {
        let registration = self
            .container
            .find(name)
            .ok_or_else(|| RagError::UnregisteredService(name.to_string()))?;

        {
            let stack = self.stack.borrow();
            if let Some(parent) = stack.last().and_then(|p| self.container.find(p)) {
                if !parent.dependencies.iter().any(|d| d == name) {
                    return Err(RagError::UndeclaredDependency {
                        service: parent.name.clone(),
                        dependency: name.to_string(),
                    });
                }
            }
            if let Some(pos) = stack.iter().position(|n| n == name) {
                let mut chain = stack[pos..].to_vec();
                chain.push(name.to_string());
                return Err(RagError::CircularDependency(chain));
            }
        }

        self.stack.borrow_mut().push(name.to_string());
        let result = self.build(registration);
        self.stack.borrow_mut().pop();
        result
    }

    fn build(&self, registration: &Registration) -> Result<Instance> {
        match registration.lifetime {
            Lifetime::PerRequest => (registration.factory)(self),
            Lifetime::Singleton => {
                let mut slot = registration.instance.lock().unwrap();
                if let Some(instance) = slot.as_ref() {
                    return Ok(instance.clone());
                }
                let instance = (registration.factory)(self)?;
                debug!(
                    service = %registration.name,
                    type_name = registration.type_name,
                    "Constructed singleton"
                );
                *slot = Some(instance.clone());
                Ok(instance)
            }
        }
    }
}
