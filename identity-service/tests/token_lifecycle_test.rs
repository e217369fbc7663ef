//! Access and CSRF token behavior that runs without a database.

mod common;

use tempfile::TempDir;
use uuid::Uuid;

use identity_service::models::{default_permissions, UserRole};
use identity_service::services::ServiceError;

#[tokio::test]
async fn access_token_round_trip_preserves_claims() {
    let dir = TempDir::new().unwrap();
    let config = common::jwt_config(&dir, 15);
    let service = common::token_service(&config);

    let mut user = common::test_user("lawyer@example.com");
    user.firm_id = Some(Uuid::new_v4());
    let session_id = Uuid::new_v4();
    let permissions = default_permissions(UserRole::Lawyer, false);

    let token = service
        .sign_access_token(&user, session_id, permissions.clone())
        .unwrap();
    let claims = service.validate_access_token(&token).unwrap();

    assert_eq!(claims.sub, user.user_id.to_string());
    assert_eq!(claims.sid, session_id.to_string());
    assert_eq!(claims.email, "lawyer@example.com");
    assert_eq!(claims.role, "lawyer");
    assert_eq!(claims.firm_id, user.firm_id);
    assert_eq!(claims.permissions, permissions);
    assert_eq!(claims.iss, "https://auth.test");
    assert_eq!(claims.aud, "test-platform");
}

#[tokio::test]
async fn expired_token_reports_expiry_not_invalidity() {
    let dir = TempDir::new().unwrap();
    // Negative expiry backdates the token beyond the validation leeway.
    let config = common::jwt_config(&dir, -5);
    let service = common::token_service(&config);

    let user = common::test_user("expired@example.com");
    let token = service
        .sign_access_token(&user, Uuid::new_v4(), Default::default())
        .unwrap();

    let err = service.validate_access_token(&token).unwrap_err();
    assert!(matches!(err, ServiceError::TokenExpired));
}

#[tokio::test]
async fn token_for_another_audience_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut foreign_config = common::jwt_config(&dir, 15);
    foreign_config.audience = "another-platform".to_string();
    let foreign = common::token_service(&foreign_config);

    let config = common::jwt_config(&dir, 15);
    let service = common::token_service(&config);

    let user = common::test_user("user@example.com");
    let token = foreign
        .sign_access_token(&user, Uuid::new_v4(), Default::default())
        .unwrap();

    let err = service.validate_access_token(&token).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidToken));
}

#[tokio::test]
async fn tampered_token_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = common::jwt_config(&dir, 15);
    let service = common::token_service(&config);

    let user = common::test_user("user@example.com");
    let token = service
        .sign_access_token(&user, Uuid::new_v4(), Default::default())
        .unwrap();

    // Flip a character in the payload segment.
    let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
    let payload = &mut parts[1];
    let flipped = if payload.ends_with('A') { "B" } else { "A" };
    payload.truncate(payload.len() - 1);
    payload.push_str(flipped);
    let tampered = parts.join(".");

    let err = service.validate_access_token(&tampered).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidToken));
}

#[tokio::test]
async fn csrf_token_verifies_and_rejects_mismatch() {
    let dir = TempDir::new().unwrap();
    let config = common::jwt_config(&dir, 15);
    let service = common::token_service(&config);

    let session_id = Uuid::new_v4();
    let token = service.issue_csrf(session_id).await.unwrap();

    service.verify_csrf(session_id, &token).await.unwrap();

    let err = service
        .verify_csrf(session_id, "not-the-token")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CsrfMismatch));

    // A different session has no stored value at all.
    let err = service
        .verify_csrf(Uuid::new_v4(), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CsrfMismatch));
}

#[tokio::test]
async fn reissuing_csrf_invalidates_the_previous_value() {
    let dir = TempDir::new().unwrap();
    let config = common::jwt_config(&dir, 15);
    let service = common::token_service(&config);

    let session_id = Uuid::new_v4();
    let first = service.issue_csrf(session_id).await.unwrap();
    let second = service.issue_csrf(session_id).await.unwrap();
    assert_ne!(first, second);

    assert!(service.verify_csrf(session_id, &first).await.is_err());
    service.verify_csrf(session_id, &second).await.unwrap();
}
