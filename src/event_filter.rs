//! Decides which workload changes are worth a reconcile pass.
//!
//! The watcher reports objects as applied or deleted. `NotificationTracker` turns that into
//! create/update/delete notifications by remembering the last object seen per key, and
//! `EventFilter` classifies those notifications.

use globset::{Glob, GlobSet, GlobSetBuilder};
use kube::Resource;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    Created(K),
    Updated {
        old_generation: Option<i64>,
        object: K,
    },
    /// `state_unknown` marks objects that disappeared while the watch was disconnected.
    Deleted { object: K, state_unknown: bool },
}

impl<K> Notification<K> {
    pub fn object(&self) -> &K {
        match self {
            Notification::Created(object)
            | Notification::Updated { object, .. }
            | Notification::Deleted { object, .. } => object,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            Notification::Created(object)
            | Notification::Updated { object, .. }
            | Notification::Deleted { object, .. } => object,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    ignored_namespaces: GlobSet,
}

impl EventFilter {
    /// `ignore_namespaces` entries are glob patterns matched against the whole namespace.
    pub fn new(ignore_namespaces: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_namespaces {
            let pattern = pattern.trim();
            if !pattern.is_empty() {
                builder.add(Glob::new(pattern)?);
            }
        }
        Ok(Self {
            ignored_namespaces: builder.build()?,
        })
    }

    pub fn is_namespace_ignored(&self, namespace: &str) -> bool {
        self.ignored_namespaces.is_match(namespace)
    }

    pub fn is_relevant<K: Resource>(&self, notification: &Notification<K>) -> bool {
        let namespace = notification.object().meta().namespace.as_deref().unwrap_or("");
        if self.is_namespace_ignored(namespace) {
            return false;
        }
        match notification {
            Notification::Created(_) => true,
            // Status-only updates leave the generation untouched
            Notification::Updated {
                old_generation,
                object,
            } => *old_generation != object.meta().generation,
            Notification::Deleted { state_unknown, .. } => !state_unknown,
        }
    }
}

/// Converts watcher events into notifications, remembering the last generation seen per object.
pub struct NotificationTracker<K>
where
    K: Resource<DynamicType = ()>,
{
    generations: HashMap<ObjectRef<K>, Option<i64>>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Default for NotificationTracker<K>
where
    K: Resource<DynamicType = ()>,
{
    fn default() -> Self {
        Self {
            generations: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K> NotificationTracker<K>
where
    K: Resource<DynamicType = ()> + Default,
{
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(object) => vec![self.applied(object)],
            watcher::Event::Delete(object) => {
                self.generations.remove(&ObjectRef::from_obj(&object));
                vec![Notification::Deleted {
                    object,
                    state_unknown: false,
                }]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(&object));
                }
                vec![self.applied(object)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let vanished: Vec<ObjectRef<K>> = self
                    .generations
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .map(|key| {
                        self.generations.remove(&key);
                        Notification::Deleted {
                            object: stub_object(&key),
                            state_unknown: true,
                        }
                    })
                    .collect()
            }
        }
    }

    fn applied(&mut self, object: K) -> Notification<K> {
        let generation = object.meta().generation;
        match self
            .generations
            .insert(ObjectRef::from_obj(&object), generation)
        {
            None => Notification::Created(object),
            Some(old_generation) => Notification::Updated {
                old_generation,
                object,
            },
        }
    }
}

/// An object carrying only the name and namespace of `key`; its last state is no longer known.
fn stub_object<K>(key: &ObjectRef<K>) -> K
where
    K: Resource<DynamicType = ()> + Default,
{
    let mut object = K::default();
    object.meta_mut().name = Some(key.name.clone());
    object.meta_mut().namespace = key.namespace.clone();
    object
}
