//! Session → coordinator registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::coordinator::{DependencyCoordinator, DependencySettings, ReadinessProbe};

/// Owns the dependency coordinator of every active session
#[derive(Clone)]
pub struct CoordinatorRegistry {
    probe: Arc<dyn ReadinessProbe>,
    settings: DependencySettings,
    coordinators: Arc<Mutex<HashMap<String, DependencyCoordinator>>>,
}

impl CoordinatorRegistry {
    /// Registry whose coordinators query `probe`
    pub fn new(probe: Arc<dyn ReadinessProbe>, settings: DependencySettings) -> Self {
        Self {
            probe,
            settings,
            coordinators: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Coordinator of `session`, created on first use
    pub fn get_or_create(&self, session: &str) -> DependencyCoordinator {
        self.coordinators
            .lock()
            .entry(session.to_string())
            .or_insert_with(|| {
                debug!(session = %session, "creating dependency coordinator");
                DependencyCoordinator::new(session, self.probe.clone(), self.settings.clone())
            })
            .clone()
    }

    /// Coordinator of `session` if one exists
    pub fn get(&self, session: &str) -> Option<DependencyCoordinator> {
        self.coordinators.lock().get(session).cloned()
    }

    /// Remove and dispose the coordinator of `session`; false if there was none
    pub fn dispose(&self, session: &str) -> bool {
        let removed = self.coordinators.lock().remove(session);
        match removed {
            Some(coordinator) => {
                coordinator.dispose();
                debug!(session = %session, "disposed dependency coordinator");
                true
            }
            None => false,
        }
    }

    /// Number of live coordinators
    pub fn len(&self) -> usize {
        self.coordinators.lock().len()
    }

    /// Whether no coordinator is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
