//! Installation reconciliation: claiming, re-pointing, reactivating and
//! cleaning up integrations for installation-style connectors.

mod test_utils;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use integrations::connectors::Connector;
use integrations::error::IntegrationError;
use integrations::models::{ConnectorType, IntegrationStatus};
use integrations::repositories::{IntegrationQuery, ResourceRepository};
use test_utils::{
    ScriptedInstallation, build_service, installation_callback, resource, setup_test_db_arc,
};

#[tokio::test]
async fn first_claim_creates_active_integration() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    connector.set_resources(vec![resource(1, "api"), resource(2, "web")]);
    let service = build_service(db.clone(), vec![connector.clone() as Arc<dyn Connector>]);

    let data = installation_callback(&service, "o1", "u1", "12345");
    let integration = service
        .authorize_integration(ConnectorType::Github, data)
        .await
        .unwrap();

    assert_eq!(integration.status, IntegrationStatus::Active);
    assert_eq!(integration.bot_id, "12345");
    assert_eq!(integration.organization_id, "o1");
    assert_eq!(integration.user_id, "u1");

    // The claim queues a background sync of the installation's resources.
    connector.wait_for_syncs(1).await;
    let resources = ResourceRepository::new(db.clone())
        .list(integration.id)
        .await
        .unwrap();
    assert_eq!(resources.len(), 2);
}

#[tokio::test]
async fn claiming_the_same_installation_twice_is_idempotent() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let first = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "12345"),
        )
        .await
        .unwrap();
    let second = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u2", "12345"),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    // The second claim never reaches the vendor.
    assert_eq!(connector.authorizations.load(Ordering::SeqCst), 1);

    let all = service
        .integrations(&IntegrationQuery::for_organization("o1"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn new_installation_repoints_the_active_integration() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    connector.set_resources(vec![resource(1, "api")]);
    let service = build_service(db.clone(), vec![connector.clone() as Arc<dyn Connector>]);

    let original = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "111"),
        )
        .await
        .unwrap();
    connector.wait_for_syncs(1).await;

    connector.set_resources(vec![resource(7, "billing")]);
    let repointed = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u2", "222"),
        )
        .await
        .unwrap();

    assert_eq!(repointed.id, original.id);
    assert_eq!(repointed.bot_id, "222");
    assert_eq!(repointed.user_id, "u2");
    assert!(repointed.is_active());

    let all = service
        .integrations(&IntegrationQuery::for_organization("o1"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    connector.wait_for_syncs(2).await;
    let resources = ResourceRepository::new(db).list(original.id).await.unwrap();
    let ids: Vec<i64> = resources.iter().map(|r| r.external_resource_id).collect();
    assert_eq!(ids, vec![7]);
}

#[tokio::test]
async fn fresh_claim_removes_inactive_leftovers() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let stale = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "111"),
        )
        .await
        .unwrap();
    connector.wait_for_syncs(1).await;
    service.deactivate(stale.id).await.unwrap();

    let fresh = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "222"),
        )
        .await
        .unwrap();

    assert_ne!(fresh.id, stale.id);
    let all = service
        .integrations(&IntegrationQuery::for_organization("o1"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].bot_id, "222");
    assert!(all[0].is_active());
}

#[tokio::test]
async fn reclaiming_an_inactive_installation_reactivates_it() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let original = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "12345"),
        )
        .await
        .unwrap();
    connector.wait_for_syncs(1).await;
    service.deactivate(original.id).await.unwrap();

    let reactivated = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "12345"),
        )
        .await
        .unwrap();

    assert_eq!(reactivated.id, original.id);
    assert_eq!(reactivated.status, IntegrationStatus::Active);
}

#[tokio::test]
async fn installation_owned_by_another_organization_is_rejected() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o1", "u1", "12345"),
        )
        .await
        .unwrap();

    let err = service
        .authorize_integration(
            ConnectorType::Github,
            installation_callback(&service, "o2", "u9", "12345"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::DuplicateIntegration(_)));

    let theirs = service
        .integrations(&IntegrationQuery::for_organization("o2"))
        .await
        .unwrap();
    assert!(theirs.is_empty());
}

#[tokio::test]
async fn concurrent_claims_leave_one_active_integration() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    connector.set_authorization_delay(Duration::from_millis(25));
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let claims = ["111", "222", "333", "444"].map(|installation_id| {
        let service = service.clone();
        tokio::spawn(async move {
            let data = installation_callback(&service, "o1", "u1", installation_id);
            service
                .authorize_integration(ConnectorType::Github, data)
                .await
        })
    });

    let mut succeeded = 0;
    for claim in claims {
        match claim.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(IntegrationError::DuplicateIntegration(_))
            | Err(IntegrationError::AlreadyConnected { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(succeeded >= 1);

    let active = service
        .integrations(
            &IntegrationQuery::for_organization("o1").with_status(IntegrationStatus::Active),
        )
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn concurrent_claims_of_one_installation_resolve_to_one_row() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    connector.set_authorization_delay(Duration::from_millis(25));
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let claims = ["u1", "u2"].map(|user_id| {
        let service = service.clone();
        tokio::spawn(async move {
            let data = installation_callback(&service, "o1", user_id, "555");
            service
                .authorize_integration(ConnectorType::Github, data)
                .await
        })
    });

    let mut succeeded = 0;
    let mut duplicates = 0;
    for claim in claims {
        match claim.await.unwrap() {
            Ok(integration) => {
                assert_eq!(integration.bot_id, "555");
                succeeded += 1;
            }
            Err(IntegrationError::DuplicateIntegration(_)) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((succeeded, duplicates), (1, 1));
    // Both claims reached the vendor before either row existed.
    assert_eq!(connector.authorizations.load(Ordering::SeqCst), 2);

    let all = service
        .integrations(&IntegrationQuery::for_organization("o1"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn missing_installation_id_is_invalid() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector.clone() as Arc<dyn Connector>]);

    let mut data = installation_callback(&service, "o1", "u1", "ignored");
    data.installation_id = Some("   ".into());
    let err = service
        .authorize_integration(ConnectorType::Github, data)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidRequest(_)));
    assert_eq!(connector.authorizations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_state_is_rejected() {
    let db = setup_test_db_arc().await.unwrap();
    let connector = ScriptedInstallation::new();
    let service = build_service(db, vec![connector as Arc<dyn Connector>]);

    let mut data = installation_callback(&service, "o1", "u1", "12345");
    data.state = None;
    let err = service
        .authorize_integration(ConnectorType::Github, data)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidState(_)));
}
