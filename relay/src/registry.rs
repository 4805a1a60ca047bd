use crate::credential::Credential;
use crate::environment::{EnvironmentContext, EnvironmentId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Maps every credential to the environment it identifies.
///
/// Several credentials usually share one environment. Reads take a shared
/// lock for the duration of a single map access; writes hold the exclusive
/// lock only while touching the map, never across an await.
#[derive(Default)]
pub struct EnvironmentRegistry {
    environments: RwLock<HashMap<Credential, Arc<EnvironmentContext>>>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        self.environments.read().get(credential).cloned()
    }

    /// Associates one credential with an environment, replacing any previous
    /// association of that credential.
    pub fn put(&self, credential: Credential, environment: Arc<EnvironmentContext>) {
        self.environments.write().insert(credential, environment);
    }

    /// Registers every credential of `environment` in one step, so readers
    /// see either none or all of them.
    pub fn put_all(&self, environment: &Arc<EnvironmentContext>) {
        let mut write_guard = self.environments.write();
        for credential in environment.credentials().iter() {
            write_guard.insert(credential.clone(), environment.clone());
        }
    }

    /// Removes one association. The environment itself is left open: other
    /// credentials may still reference it.
    pub fn remove(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        self.environments.write().remove(credential)
    }

    /// Removes every credential pointing at the environment `id`.
    pub fn remove_environment(&self, id: EnvironmentId) -> Option<Arc<EnvironmentContext>> {
        let mut removed = None;
        self.environments.write().retain(|_, environment| {
            if environment.id() == id {
                removed = Some(environment.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<EnvironmentContext>> {
        self.environments
            .read()
            .values()
            .find(|environment| environment.name() == name)
            .cloned()
    }

    /// Each distinct environment once, however many credentials reference it.
    /// Sorted by name.
    pub fn all_environments(&self) -> Vec<Arc<EnvironmentContext>> {
        dedup(self.environments.read().values().cloned())
    }

    /// Number of registered credentials.
    pub fn len(&self) -> usize {
        self.environments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.read().is_empty()
    }

    /// Empties the registry, returning each distinct environment once.
    pub(crate) fn teardown(&self) -> Vec<Arc<EnvironmentContext>> {
        let drained = std::mem::take(&mut *self.environments.write());
        dedup(drained.into_values())
    }
}

fn dedup(
    environments: impl Iterator<Item = Arc<EnvironmentContext>>,
) -> Vec<Arc<EnvironmentContext>> {
    let mut seen = HashSet::new();
    let mut distinct: Vec<_> = environments
        .filter(|environment| seen.insert(environment.id()))
        .collect();
    distinct.sort_by(|a, b| a.name().cmp(b.name()).then(a.id().cmp(&b.id())));
    distinct
}
