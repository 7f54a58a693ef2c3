use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware,
    routing::get,
    Extension, Router,
};
use tower::ServiceExt;

use shared_models::auth::User;
use shared_utils::extractor::auth_middleware;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

fn protected_app() -> Router {
    let config = TestConfig::default().to_arc();

    Router::new()
        .route("/whoami", get(|Extension(user): Extension<User>| async move { user.id }))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
}

#[tokio::test]
async fn test_missing_header_is_unauthorized() {
    let response = protected_app()
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_non_bearer_header_is_unauthorized() {
    let response = protected_app()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header(AUTHORIZATION, "Basic abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_valid_token_reaches_handler_with_identity() {
    let config = TestConfig::default();
    let user = TestUser::patient("patient@example.com");
    let token = JwtTestUtils::create_test_token(&user, &config.jwt_secret, None);

    let response = protected_app()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header(AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(String::from_utf8(body.to_vec()).unwrap(), user.id);
}
