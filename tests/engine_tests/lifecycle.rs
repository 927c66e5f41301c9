//! Stories about the lifecycle of deployment sessions

use rsync_common::{Criteria, DeploymentState, Error};
use rsync_provider::IdentityScope;
use rsync_store::{ResourceOutcome, SessionRecord};

use super::recorder::{app, cluster, composite, Harness};

async fn state(harness: &Harness, id: &str) -> DeploymentState {
    harness.engine.sessions().get(id).await.unwrap().state
}

/// Story: the web tier waits until its database is ready on every cluster
#[tokio::test]
async fn story_install_deploys_apps_in_dependency_order() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![
                app(
                    "web",
                    vec![cluster("aws+edge", &["web+Deployment", "web+Service"], "v1")],
                    &[("db", Criteria::ready(0))],
                ),
                app(
                    "db",
                    vec![
                        cluster("aws+core", &["db+StatefulSet"], "v1"),
                        cluster("aws+edge", &["db-cache+ConfigMap"], "v1"),
                    ],
                    &[],
                ),
            ]),
        )
        .await;

    harness.engine.install("s1").await.unwrap();
    assert_eq!(state(&harness, "s1").await, DeploymentState::Instantiated);

    let recorder = &harness.recorder;
    let web = recorder.position("s1 aws+edge web+Deployment").unwrap();
    assert!(recorder.position("s1 aws+core db+StatefulSet").unwrap() < web);
    assert!(recorder.position("s1 aws+edge db-cache+ConfigMap").unwrap() < web);
    assert!(recorder.log().iter().all(|line| line.starts_with("create ")));

    let deployed = recorder.object("aws+edge", "web+Deployment").unwrap();
    assert_eq!(deployed.session, "s1");
    assert_eq!(deployed.app, "web");
    assert!(recorder.has_status_cr("s1", "web", "aws+edge"));
    assert_eq!(recorder.watcher_count(), 3);

    let status = harness.engine.read("s1").await.unwrap();
    assert_eq!(status.state, DeploymentState::Instantiated);
    let web = &status.apps["web"];
    assert!(web.deployed);
    assert!(web.clusters["aws+edge"].ready);
    assert_eq!(
        web.clusters["aws+edge"].resources["web+Service"],
        ResourceOutcome::Applied
    );
}

/// Story: a rejected resource rolls the whole session back
#[tokio::test]
async fn story_failed_install_is_compensated() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness.recorder.fail("web+Deployment");
    harness
        .session(
            "s1",
            composite(vec![
                app("db", vec![cluster("aws+core", &["db+StatefulSet"], "v1")], &[]),
                app(
                    "web",
                    vec![cluster("aws+edge", &["web+Deployment"], "v1")],
                    &[("db", Criteria::deployed(0))],
                ),
            ]),
        )
        .await;

    let err = harness.engine.install("s1").await.unwrap_err();
    assert!(err.to_string().contains("web+Deployment"));
    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminated);
    assert_eq!(harness.recorder.objects_of("s1"), 0);
    assert!(!harness.recorder.has_status_cr("s1", "db", "aws+core"));
    assert!(harness.engine.coordinators().get("s1").is_none());
}

#[tokio::test]
async fn terminate_is_allowed_while_updating() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app("db", vec![cluster("aws+core", &["db+StatefulSet"], "v1")], &[])]),
        )
        .await;
    harness
        .engine
        .sessions()
        .set_state("s1", DeploymentState::Updating)
        .await
        .unwrap();

    harness.engine.terminate("s1").await.unwrap();
    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminated);
}

#[tokio::test]
async fn instantiate_while_terminating_is_rejected() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app("db", vec![cluster("aws+core", &["db+StatefulSet"], "v1")], &[])]),
        )
        .await;
    harness
        .engine
        .sessions()
        .set_state("s1", DeploymentState::Terminating)
        .await
        .unwrap();

    let err = harness.engine.instantiate("s1").await.unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { .. }));
    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminating);
    assert!(harness.recorder.log().is_empty());
}

/// Story: a new revision takes over shared objects and the old one leaves
#[tokio::test]
async fn story_update_keeps_shared_objects_on_cluster_scoped_backends() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app(
                "web",
                vec![cluster(
                    "aws+edge",
                    &["web+ConfigMap", "legacy+ConfigMap", "web+Deployment"],
                    "v1",
                )],
                &[],
            )]),
        )
        .await;
    harness.engine.install("s1").await.unwrap();

    harness
        .session(
            "s2",
            composite(vec![app(
                "web",
                vec![cluster("aws+edge", &["web+ConfigMap", "web+Deployment"], "v2")],
                &[],
            )]),
        )
        .await;
    harness.engine.update("s1", "s2").await.unwrap();

    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminated);
    assert_eq!(state(&harness, "s2").await, DeploymentState::Updated);

    let recorder = &harness.recorder;
    let deployment = recorder.object("aws+edge", "web+Deployment").unwrap();
    assert_eq!(deployment.session, "s2");
    assert!(deployment.manifest.contains("v2"));
    assert!(recorder.object("aws+edge", "web+ConfigMap").is_some());
    assert!(recorder.object("aws+edge", "legacy+ConfigMap").is_none());
    assert!(recorder.position("delete s1 aws+edge web+Deployment").is_none());
    assert!(recorder.position("delete s1 aws+edge legacy+ConfigMap").is_some());
    assert!(recorder.position("apply s2 aws+edge web+Deployment").is_some());
}

#[tokio::test]
async fn update_removes_everything_on_session_scoped_backends() {
    let harness = Harness::new(IdentityScope::Session).await;
    let revision = |payload| {
        composite(vec![app(
            "web",
            vec![cluster("aws+edge", &["web+ConfigMap", "web+Deployment"], payload)],
            &[],
        )])
    };
    harness.session("s1", revision("v1")).await;
    harness.engine.install("s1").await.unwrap();
    assert_eq!(harness.recorder.objects_of("s1"), 2);

    harness.session("s2", revision("v2")).await;
    harness.engine.update("s1", "s2").await.unwrap();

    assert_eq!(harness.recorder.objects_of("s1"), 0);
    assert_eq!(harness.recorder.objects_of("s2"), 2);
    assert!(harness
        .recorder
        .object("aws+edge", "s2/web+Deployment")
        .unwrap()
        .manifest
        .contains("v2"));
}

#[tokio::test]
async fn rollback_returns_to_an_earlier_revision() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    let revision = |payload| {
        composite(vec![app(
            "web",
            vec![cluster("aws+edge", &["web+Deployment"], payload)],
            &[],
        )])
    };
    harness.session("v2", revision("v2")).await;
    harness.engine.install("v2").await.unwrap();

    harness.session("v1", revision("v1")).await;
    harness.engine.rollback("v2", "v1").await.unwrap();

    assert_eq!(state(&harness, "v2").await, DeploymentState::Terminated);
    assert_eq!(state(&harness, "v1").await, DeploymentState::Updated);
    let deployment = harness.recorder.object("aws+edge", "web+Deployment").unwrap();
    assert_eq!(deployment.session, "v1");
    assert!(deployment.manifest.contains("v1"));
}

/// Story: a release is rolled out and then rolled back to the session it replaced
#[tokio::test]
async fn story_rollback_revives_the_replaced_session() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    let revision = |payload| {
        composite(vec![app(
            "web",
            vec![cluster("aws+edge", &["web+Deployment"], payload)],
            &[],
        )])
    };
    harness.session("v1", revision("v1")).await;
    harness.session("v2", revision("v2")).await;
    harness.engine.install("v1").await.unwrap();

    harness.engine.update("v1", "v2").await.unwrap();
    assert_eq!(state(&harness, "v1").await, DeploymentState::Terminated);
    assert_eq!(state(&harness, "v2").await, DeploymentState::Updated);

    harness.engine.rollback("v2", "v1").await.unwrap();
    assert_eq!(state(&harness, "v1").await, DeploymentState::Updated);
    assert_eq!(state(&harness, "v2").await, DeploymentState::Terminated);
    let deployment = harness.recorder.object("aws+edge", "web+Deployment").unwrap();
    assert_eq!(deployment.session, "v1");
    assert!(deployment.manifest.contains("v1"));

    let status = harness.engine.read("v1").await.unwrap();
    assert!(status.apps["web"].deployed);
}

#[tokio::test]
async fn update_from_a_created_session_is_rejected() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    let revision = composite(vec![app("web", vec![cluster("aws+edge", &["web+Deployment"], "v1")], &[])]);
    harness.session("s1", revision.clone()).await;
    harness.session("s2", revision).await;

    let err = harness.engine.update("s1", "s2").await.unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { .. }));
    assert_eq!(state(&harness, "s2").await, DeploymentState::Created);
}

/// Story: instantiating an already deployed session applies its latest payload
#[tokio::test]
async fn story_reinstantiate_applies_latest_payload() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app("web", vec![cluster("aws+edge", &["web+Deployment"], "v1")], &[])]),
        )
        .await;
    harness.engine.install("s1").await.unwrap();

    let mut record = SessionRecord::new(
        "s1",
        composite(vec![app("web", vec![cluster("aws+edge", &["web+Deployment"], "v2")], &[])]),
    );
    record.state = DeploymentState::Instantiated;
    harness.engine.sessions().put(&record).await.unwrap();

    harness.engine.instantiate("s1").await.unwrap();
    assert!(harness
        .recorder
        .object("aws+edge", "web+Deployment")
        .unwrap()
        .manifest
        .contains("v2"));
    assert!(harness
        .recorder
        .position("apply s1 aws+edge web+Deployment")
        .is_some());
    assert_eq!(harness.recorder.watcher_count(), 1);
}

#[tokio::test]
async fn cluster_without_provider_is_a_configuration_error() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app("web", vec![cluster("providerA", &["web+Deployment"], "v1")], &[])]),
        )
        .await;

    let err = harness.engine.install("s1").await.unwrap_err();
    assert!(err.is_configuration());
    assert!(harness.recorder.log().is_empty());
    // Compensation skips the cluster that was never reached
    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminated);
}

#[tokio::test]
async fn compensation_cleans_reached_clusters_only() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![
                app("db", vec![cluster("aws+core", &["db+StatefulSet"], "v1")], &[]),
                app(
                    "web",
                    vec![cluster("providerA", &["web+Deployment"], "v1")],
                    &[("db", Criteria::deployed(0))],
                ),
            ]),
        )
        .await;

    let err = harness.engine.install("s1").await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(state(&harness, "s1").await, DeploymentState::Terminated);
    assert_eq!(harness.recorder.objects_of("s1"), 0);
    assert!(harness
        .recorder
        .position("delete s1 aws+core db+StatefulSet")
        .is_some());
}

/// Story: a dependency on a skipped app is refused instead of waiting forever
#[tokio::test]
async fn story_dependency_on_skipped_app_is_a_configuration_error() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    let mut db = app("db", vec![cluster("aws+core", &["db+StatefulSet"], "v1")], &[]);
    db.skip = true;
    harness
        .session(
            "s1",
            composite(vec![
                db,
                app(
                    "web",
                    vec![cluster("aws+edge", &["web+Deployment"], "v1")],
                    &[("db", Criteria::deployed(0))],
                ),
            ]),
        )
        .await;

    let installed =
        tokio::time::timeout(std::time::Duration::from_secs(3), harness.engine.install("s1"))
            .await
            .expect("install must not block on a skipped app");
    let err = installed.unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("skipped app db"));
    assert_eq!(state(&harness, "s1").await, DeploymentState::Created);
    assert!(harness.recorder.log().is_empty());
}

/// Story: the deployment is staged only after its migration job succeeded
#[tokio::test]
async fn story_resource_wave_waits_for_job() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    let mut edge = cluster(
        "aws+edge",
        &["migrate+Job", "web+Deployment", "web+Service"],
        "v1",
    );
    edge.dependency.insert(
        "web+Deployment".to_string(),
        vec!["migrate+Job".to_string()],
    );
    harness
        .session("s1", composite(vec![app("web", vec![edge], &[])]))
        .await;

    harness.engine.install("s1").await.unwrap();
    let recorder = &harness.recorder;
    assert!(
        recorder.position("migrate+Job").unwrap() < recorder.position("web+Deployment").unwrap()
    );
    assert!(recorder.object("aws+edge", "web+Service").is_some());
}

#[tokio::test]
async fn deleting_a_session_drops_its_coordinator() {
    let harness = Harness::new(IdentityScope::Cluster).await;
    harness
        .session(
            "s1",
            composite(vec![app("web", vec![cluster("aws+edge", &["web+Deployment"], "v1")], &[])]),
        )
        .await;
    harness.engine.install("s1").await.unwrap();
    assert!(harness.engine.coordinators().get("s1").is_some());

    assert!(harness.engine.delete_session("s1").await.unwrap());
    assert!(harness.engine.coordinators().get("s1").is_none());
    assert!(harness.engine.read("s1").await.unwrap_err().is_not_found());
    assert!(!harness.engine.delete_session("s1").await.unwrap());
}
