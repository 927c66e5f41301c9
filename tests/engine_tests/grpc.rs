//! Stories about the deployment services as an orchestrator sees them

use tonic::{Code, Request};

use rsync::server::{InstallService, UpdateService};
use rsync_common::DeploymentState;
use rsync_proto::{
    InstallApp, InstallAppRequest, RollbackAppRequest, UninstallAppRequest, UpdateApp,
    UpdateAppRequest,
};
use rsync_provider::IdentityScope;

use super::recorder::{app, cluster, composite, Harness};

async fn harness_with(sessions: &[(&str, &str)]) -> Harness {
    let harness = Harness::new(IdentityScope::Cluster).await;
    for (id, payload) in sessions {
        harness
            .session(
                id,
                composite(vec![app(
                    "web",
                    vec![cluster("aws+edge", &["web+Deployment"], payload)],
                    &[],
                )]),
            )
            .await;
    }
    harness
}

/// Story: an orchestrator installs a session and later uninstalls it
#[tokio::test]
async fn story_install_then_uninstall() {
    let harness = harness_with(&[("s1", "v1")]).await;
    let service = InstallService::new(harness.engine.clone());

    let installed = service
        .install_app(Request::new(InstallAppRequest {
            app_context_id: "s1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(installed.app_context_installed, "{}", installed.app_context_install_message);
    assert!(harness.recorder.object("aws+edge", "web+Deployment").is_some());

    let uninstalled = service
        .uninstall_app(Request::new(UninstallAppRequest {
            app_context_id: "s1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(uninstalled.app_context_uninstalled);
    assert!(harness.recorder.object("aws+edge", "web+Deployment").is_none());
    assert_eq!(
        harness.engine.sessions().get("s1").await.unwrap().state,
        DeploymentState::Terminated
    );
}

#[tokio::test]
async fn failed_install_is_reported_in_the_response() {
    let harness = harness_with(&[("s1", "v1")]).await;
    harness.recorder.fail("web+Deployment");
    let service = InstallService::new(harness.engine.clone());

    let response = service
        .install_app(Request::new(InstallAppRequest {
            app_context_id: "s1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.app_context_installed);
    assert!(response.app_context_install_message.contains("instantiate"));
    assert!(response.app_context_install_message.contains("s1"));
}

#[tokio::test]
async fn unknown_session_is_reported_not_raised() {
    let harness = harness_with(&[]).await;
    let service = InstallService::new(harness.engine.clone());

    let response = service
        .uninstall_app(Request::new(UninstallAppRequest {
            app_context_id: "ghost".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.app_context_uninstalled);
    assert!(response.app_context_uninstall_message.contains("terminate"));
}

#[tokio::test]
async fn empty_ids_are_invalid_arguments() {
    let harness = harness_with(&[]).await;
    let install = InstallService::new(harness.engine.clone());
    let update = UpdateService::new(harness.engine.clone());

    let status = install
        .install_app(Request::new(InstallAppRequest {
            app_context_id: "  ".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = update
        .update_app(Request::new(UpdateAppRequest {
            update_from_app_context_id: "s1".to_string(),
            update_to_app_context_id: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

/// Story: a revision is rolled out and then rolled back
#[tokio::test]
async fn story_update_then_rollback() {
    let harness = harness_with(&[("s1", "v1"), ("s2", "v2")]).await;
    harness.engine.install("s1").await.unwrap();
    let service = UpdateService::new(harness.engine.clone());

    let updated = service
        .update_app(Request::new(UpdateAppRequest {
            update_from_app_context_id: "s1".to_string(),
            update_to_app_context_id: "s2".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(updated.app_context_updated, "{}", updated.app_context_update_message);
    assert!(harness
        .recorder
        .object("aws+edge", "web+Deployment")
        .unwrap()
        .manifest
        .contains("v2"));

    harness
        .session(
            "s1-again",
            composite(vec![app(
                "web",
                vec![cluster("aws+edge", &["web+Deployment"], "v1")],
                &[],
            )]),
        )
        .await;
    let rolled_back = service
        .rollback_app(Request::new(RollbackAppRequest {
            rollback_from_app_context_id: "s2".to_string(),
            rollback_to_app_context_id: "s1-again".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(rolled_back.app_context_rolledback, "{}", rolled_back.app_context_rollback_message);
    assert!(harness
        .recorder
        .object("aws+edge", "web+Deployment")
        .unwrap()
        .manifest
        .contains("v1"));
}

#[tokio::test]
async fn illegal_update_is_reported_in_the_response() {
    let harness = harness_with(&[("s1", "v1"), ("s2", "v2")]).await;
    let service = UpdateService::new(harness.engine.clone());

    let response = service
        .update_app(Request::new(UpdateAppRequest {
            update_from_app_context_id: "s1".to_string(),
            update_to_app_context_id: "s2".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.app_context_updated);
    assert!(response.app_context_update_message.contains("update"));
}
