//! Components and the component model
//!
//! A component is an application unit hosted by a component thread. The model
//! is the loader boundary: one `ComponentEntry` per role, carrying the factory
//! pair that creates and deletes the component, the thread it lives on, and
//! the services it provides and depends on.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::errors::ComponentError;
use crate::event::{Dispatcher, DispatcherHandle};
use crate::Result;

// ----------------------------------------------------------------------------
// Component
// ----------------------------------------------------------------------------

/// Lifecycle hooks, always invoked on the owning thread in this order:
/// startup, notify_shutdown, shutdown
#[async_trait]
pub trait Component: Send + 'static {
    fn role_name(&self) -> &str;

    /// Register consumers and start work
    async fn startup(&mut self, dispatcher: &mut Dispatcher) -> Result<()>;

    /// The thread is about to stop; no further events will be dispatched
    async fn notify_shutdown(&mut self, _dispatcher: &mut Dispatcher) {}

    async fn shutdown(&mut self, _dispatcher: &mut Dispatcher) {}
}

pub type CreateFn =
    Arc<dyn Fn(&ComponentEntry, &DispatcherHandle) -> Result<Box<dyn Component>> + Send + Sync>;

pub type DeleteFn = Arc<dyn Fn(Box<dyn Component>, &ComponentEntry) + Send + Sync>;

// ----------------------------------------------------------------------------
// Component Entry
// ----------------------------------------------------------------------------

/// Factory pair and metadata of one component role
#[derive(Clone)]
pub struct ComponentEntry {
    pub role_name: String,
    pub thread_name: String,
    pub services: Vec<String>,
    pub dependencies: Vec<String>,
    create: CreateFn,
    delete: DeleteFn,
}

impl ComponentEntry {
    /// Entry whose delete function simply drops the component
    pub fn new<R, T, F>(role_name: R, thread_name: T, create: F) -> Self
    where
        R: Into<String>,
        T: Into<String>,
        F: Fn(&ComponentEntry, &DispatcherHandle) -> Result<Box<dyn Component>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            role_name: role_name.into(),
            thread_name: thread_name.into(),
            services: Vec::new(),
            dependencies: Vec::new(),
            create: Arc::new(create),
            delete: Arc::new(|component: Box<dyn Component>, _: &ComponentEntry| drop(component)),
        }
    }

    pub fn with_delete<F>(mut self, delete: F) -> Self
    where
        F: Fn(Box<dyn Component>, &ComponentEntry) + Send + Sync + 'static,
    {
        self.delete = Arc::new(delete);
        self
    }

    pub fn with_service<S: Into<String>>(mut self, service: S) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_dependency<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn create(&self, dispatcher: &DispatcherHandle) -> Result<Box<dyn Component>> {
        (self.create)(self, dispatcher)
    }

    pub fn delete(&self, component: Box<dyn Component>) {
        (self.delete)(component, self)
    }
}

impl fmt::Debug for ComponentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEntry")
            .field("role_name", &self.role_name)
            .field("thread_name", &self.thread_name)
            .field("services", &self.services)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Component Model
// ----------------------------------------------------------------------------

/// Every registered component role, in registration order
#[derive(Debug, Clone, Default)]
pub struct ComponentModel {
    entries: Vec<ComponentEntry>,
}

impl ComponentModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; role names are unique
    pub fn add(&mut self, entry: ComponentEntry) -> Result<()> {
        if self.find(&entry.role_name).is_some() {
            return Err(ComponentError::DuplicateRole {
                role_name: entry.role_name,
            }
            .into());
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn find(&self, role_name: &str) -> Option<&ComponentEntry> {
        self.entries.iter().find(|e| e.role_name == role_name)
    }

    /// Entries hosted by `thread_name`, in registration order
    pub fn entries_for(&self, thread_name: &str) -> Vec<ComponentEntry> {
        self.entries
            .iter()
            .filter(|e| e.thread_name == thread_name)
            .cloned()
            .collect()
    }

    /// Distinct thread names, in order of first appearance
    pub fn thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.thread_name) {
                names.push(entry.thread_name.clone());
            }
        }
        names
    }

    /// Role providing `service`, if any
    pub fn provider_of(&self, service: &str) -> Option<&ComponentEntry> {
        self.entries
            .iter()
            .find(|e| e.services.iter().any(|s| s == service))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(String);

    #[async_trait]
    impl Component for Named {
        fn role_name(&self) -> &str {
            &self.0
        }

        async fn startup(&mut self, _dispatcher: &mut Dispatcher) -> Result<()> {
            Ok(())
        }
    }

    fn entry(role: &str, thread: &str) -> ComponentEntry {
        ComponentEntry::new(role, thread, |entry, _| {
            Ok(Box::new(Named(entry.role_name.clone())) as Box<dyn Component>)
        })
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let mut model = ComponentModel::new();
        model.add(entry("clock", "main")).unwrap();
        assert!(matches!(
            model.add(entry("clock", "other")),
            Err(crate::SvcbusError::Component(ComponentError::DuplicateRole { .. }))
        ));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_thread_grouping_keeps_order() {
        let mut model = ComponentModel::new();
        model.add(entry("a", "t1")).unwrap();
        model.add(entry("b", "t2")).unwrap();
        model.add(entry("c", "t1").with_service("timer")).unwrap();

        assert_eq!(model.thread_names(), vec!["t1", "t2"]);
        let roles: Vec<String> = model.entries_for("t1").into_iter().map(|e| e.role_name).collect();
        assert_eq!(roles, vec!["a", "c"]);
        assert_eq!(model.provider_of("timer").map(|e| e.role_name.as_str()), Some("c"));
    }

    #[test]
    fn test_factory_creates_component() {
        let component = entry("clock", "main").create(&DispatcherHandle::null()).unwrap();
        assert_eq!(component.role_name(), "clock");
    }
}
