//! Observed deployment status
//!
//! Process-local view of what the engine has done and what the clusters
//! report back. Readiness queries from the dependency coordinator and the
//! Read event are answered from here.

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use serde::Serialize;

use rsync_common::ResourceBundleStatus;

/// Outcome of the last operation on a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ResourceOutcome {
    /// Committed to the cluster
    Applied,
    /// Commit failed with the given reason
    Failed(String),
    /// Removed from the cluster
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClusterKey {
    session: String,
    app: String,
    cluster: String,
}

impl ClusterKey {
    fn new(session: &str, app: &str, cluster: &str) -> Self {
        Self {
            session: session.to_string(),
            app: app.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

/// Per-session observed status
#[derive(Debug, Default)]
pub struct StatusStore {
    observed: DashMap<ClusterKey, ResourceBundleStatus>,
    outcomes: DashMap<ClusterKey, BTreeMap<String, ResourceOutcome>>,
    deployed: DashMap<String, HashSet<String>>,
}

impl StatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest status report for an app on a cluster
    pub fn record_status(&self, session: &str, app: &str, cluster: &str, status: ResourceBundleStatus) {
        self.observed
            .insert(ClusterKey::new(session, app, cluster), status);
    }

    /// Latest status report for an app on a cluster
    pub fn status(&self, session: &str, app: &str, cluster: &str) -> Option<ResourceBundleStatus> {
        self.observed
            .get(&ClusterKey::new(session, app, cluster))
            .map(|s| s.clone())
    }

    /// Whether the latest report for the app on this cluster is ready
    pub fn is_app_ready_on(&self, session: &str, app: &str, cluster: &str) -> bool {
        self.observed
            .get(&ClusterKey::new(session, app, cluster))
            .is_some_and(|s| s.is_bundle_ready())
    }

    /// Record the outcome of an operation on a resource
    pub fn record_outcome(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        resource: &str,
        outcome: ResourceOutcome,
    ) {
        self.outcomes
            .entry(ClusterKey::new(session, app, cluster))
            .or_default()
            .insert(resource.to_string(), outcome);
    }

    /// Outcomes of every resource of an app on a cluster
    pub fn outcomes(&self, session: &str, app: &str, cluster: &str) -> BTreeMap<String, ResourceOutcome> {
        self.outcomes
            .get(&ClusterKey::new(session, app, cluster))
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    /// Mark an app as committed on every target cluster
    pub fn mark_deployed(&self, session: &str, app: &str) {
        self.deployed
            .entry(session.to_string())
            .or_default()
            .insert(app.to_string());
    }

    /// Whether an app has been committed on every target cluster
    pub fn is_deployed(&self, session: &str, app: &str) -> bool {
        self.deployed
            .get(session)
            .is_some_and(|apps| apps.contains(app))
    }

    /// Forget an app's deployment mark
    pub fn unmark_deployed(&self, session: &str, app: &str) {
        if let Some(mut apps) = self.deployed.get_mut(session) {
            apps.remove(app);
        }
    }

    /// Forget the observed reports of a session; outcomes stay readable
    pub fn clear_observed(&self, session: &str) {
        self.observed.retain(|k, _| k.session != session);
    }

    /// Forget everything recorded for a session
    pub fn clear_session(&self, session: &str) {
        self.observed.retain(|k, _| k.session != session);
        self.outcomes.retain(|k, _| k.session != session);
        self.deployed.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(ready: bool) -> ResourceBundleStatus {
        serde_json::from_value(serde_json::json!({
            "ready": ready,
            "serviceStatuses": [{"metadata": {"name": "web"}}]
        }))
        .unwrap()
    }

    #[test]
    fn latest_report_wins() {
        let store = StatusStore::new();
        store.record_status("s", "app", "p+c", report(false));
        assert!(!store.is_app_ready_on("s", "app", "p+c"));

        store.record_status("s", "app", "p+c", report(true));
        assert!(store.is_app_ready_on("s", "app", "p+c"));
        let latest = store.status("s", "app", "p+c").unwrap();
        assert!(latest.is_resource_ready("web", "Service"));
    }

    #[test]
    fn unknown_cluster_is_never_ready() {
        let store = StatusStore::new();
        assert!(!store.is_app_ready_on("s", "app", "p+c"));
        assert!(store.status("s", "app", "p+c").is_none());
    }

    #[test]
    fn outcomes_and_deployed_marks_are_cleared_per_session() {
        let store = StatusStore::new();
        store.record_outcome("s1", "a", "p+c", "web+Service", ResourceOutcome::Applied);
        store.record_outcome("s2", "a", "p+c", "web+Service", ResourceOutcome::Deleted);
        store.mark_deployed("s1", "a");
        assert!(store.is_deployed("s1", "a"));

        store.clear_session("s1");
        assert!(!store.is_deployed("s1", "a"));
        assert!(store.outcomes("s1", "a", "p+c").is_empty());
        assert_eq!(
            store.outcomes("s2", "a", "p+c")["web+Service"],
            ResourceOutcome::Deleted
        );
    }

    #[test]
    fn clearing_reports_keeps_outcomes() {
        let store = StatusStore::new();
        store.record_status("s1", "a", "p+c", report(true));
        store.record_outcome("s1", "a", "p+c", "web+Service", ResourceOutcome::Deleted);

        store.clear_observed("s1");
        assert!(!store.is_app_ready_on("s1", "a", "p+c"));
        assert_eq!(
            store.outcomes("s1", "a", "p+c")["web+Service"],
            ResourceOutcome::Deleted
        );
    }
}
