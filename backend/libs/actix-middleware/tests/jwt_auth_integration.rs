use actix_middleware::{JwtAuthMiddleware, UserId};
use actix_web::{http::StatusCode, test, web, App, HttpResponse};
use std::sync::Once;
use uuid::Uuid;

const TEST_SECRET: &str = "test-secret-key-min-32-chars-long!!!";

fn init_test_keys() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        crypto_core::jwt::initialize_jwt_secret(TEST_SECRET)
            .expect("Failed to initialize test secret");
    });
}

async fn whoami(user_id: UserId) -> HttpResponse {
    HttpResponse::Ok().body(user_id.0.to_string())
}

#[actix_web::test]
async fn test_valid_bearer_token_sets_user_id() {
    init_test_keys();
    let user_id = Uuid::new_v4();
    let token = crypto_core::jwt::generate_access_token(user_id).unwrap();

    let app = test::init_service(
        App::new()
            .wrap(JwtAuthMiddleware)
            .route("/me", web::get().to(whoami)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/me")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, user_id.to_string());
}

#[actix_web::test]
async fn test_query_token_accepted() {
    init_test_keys();
    let user_id = Uuid::new_v4();
    let token = crypto_core::jwt::generate_access_token(user_id).unwrap();

    let app = test::init_service(
        App::new()
            .wrap(JwtAuthMiddleware)
            .route("/ws", web::get().to(whoami)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/ws?token={token}"))
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, user_id.to_string());
}

#[actix_web::test]
async fn test_missing_token_rejected() {
    init_test_keys();
    let app = test::init_service(
        App::new()
            .wrap(JwtAuthMiddleware)
            .route("/me", web::get().to(whoami)),
    )
    .await;

    let req = test::TestRequest::get().uri("/me").to_request();
    let err = test::try_call_service(&app, req).await.err().unwrap();
    assert_eq!(
        err.as_response_error().status_code(),
        StatusCode::UNAUTHORIZED
    );
}

#[actix_web::test]
async fn test_garbage_token_rejected() {
    init_test_keys();
    let app = test::init_service(
        App::new()
            .wrap(JwtAuthMiddleware)
            .route("/me", web::get().to(whoami)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/me")
        .insert_header(("Authorization", "Bearer not-a-jwt"))
        .to_request();
    let err = test::try_call_service(&app, req).await.err().unwrap();
    assert_eq!(
        err.as_response_error().status_code(),
        StatusCode::UNAUTHORIZED
    );
}
