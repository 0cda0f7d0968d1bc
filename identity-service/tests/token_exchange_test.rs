mod common;

use axum::http::{header, StatusCode};
use common::*;

#[tokio::test]
async fn test_code_is_single_use() {
    let app = TestApp::spawn().await;
    let code = app.obtain_code(&[]).await;

    let first = app.exchange_code(&code).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );

    let second = app.exchange_code(&code).await;
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(second).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_redirect_uri_must_match() {
    let app = TestApp::spawn().await;
    let code = app.obtain_code(&[]).await;
    let basic = basic_auth(&app.first_party.client.client_id, &app.first_party.secret);

    let response = app
        .post_form(
            "/token",
            &[],
            Some(&basic),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", "https://app.example.com/other"),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    // The failed attempt consumed the code.
    let retry = app.exchange_code(&code).await;
    assert_eq!(retry.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_client_secret_post_is_accepted() {
    let app = TestApp::spawn().await;
    let code = app.obtain_code(&[]).await;

    let response = app
        .post_form(
            "/token",
            &[],
            None,
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", &app.first_party.client.client_id),
                ("client_secret", &app.first_party.secret),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = body_json(response).await;
    assert!(tokens["access_token"].is_string());
    assert!(tokens["expires_in"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_wrong_client_secret_is_invalid_client() {
    let app = TestApp::spawn().await;
    let code = app.obtain_code(&[]).await;
    let basic = basic_auth(&app.first_party.client.client_id, "wrong-secret");

    let response = app
        .post_form(
            "/token",
            &[],
            Some(&basic),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_code_issued_to_another_client_is_rejected() {
    let app = TestApp::spawn().await;
    let code = app.obtain_code(&[]).await;
    let basic = basic_auth(&app.third_party.client.client_id, &app.third_party.secret);

    let response = app
        .post_form(
            "/token",
            &[],
            Some(&basic),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_public_client_with_pkce_s256() {
    let app = TestApp::spawn().await;
    let challenge = pkce_challenge(CODE_VERIFIER);
    let (response, _) = app
        .authorize_and_login(
            "",
            &app.public.client,
            &[
                ("code_challenge", &challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .await;
    let code = query_param(&location(&response), "code").unwrap();

    let response = app
        .post_form(
            "/token",
            &[],
            None,
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", &app.public.client.client_id),
                ("code_verifier", CODE_VERIFIER),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_public_client_with_wrong_verifier_is_invalid_grant() {
    let app = TestApp::spawn().await;
    let challenge = pkce_challenge(CODE_VERIFIER);
    let (response, _) = app
        .authorize_and_login(
            "",
            &app.public.client,
            &[
                ("code_challenge", &challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .await;
    let code = query_param(&location(&response), "code").unwrap();

    let response = app
        .post_form(
            "/token",
            &[],
            None,
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", &app.public.client.client_id),
                ("code_verifier", "not-the-verifier-not-the-verifier-not-the-v"),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_public_client_without_pkce_is_refused_at_authorize() {
    let app = TestApp::spawn().await;

    let response = app.get(&authorize_uri("", &app.public.client, &[])).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        query_param(&location(&response), "error").as_deref(),
        Some("invalid_request")
    );
}

#[tokio::test]
async fn test_unsupported_and_missing_grant_type() {
    let app = TestApp::spawn().await;
    let basic = basic_auth(&app.first_party.client.client_id, &app.first_party.secret);

    let response = app
        .post_form("/token", &[], Some(&basic), &[("grant_type", "password")])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "unsupported_grant_type");

    let response = app.post_form("/token", &[], Some(&basic), &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn test_userinfo_returns_claims_for_access_token() {
    let app = TestApp::spawn().await;
    let tokens = app.obtain_tokens().await;
    let bearer = format!("Bearer {}", tokens["access_token"].as_str().unwrap());

    let response = app
        .send(
            axum::http::Request::builder()
                .uri("/userinfo")
                .header(header::HOST, HOST)
                .header(header::AUTHORIZATION, bearer)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["sub"], app.user.user_id.to_string());
    assert_eq!(info["email"], USER_EMAIL);
    assert_eq!(info["email_verified"], true);
    assert_eq!(info["fields"]["given_name"], "Ada");
}

#[tokio::test]
async fn test_userinfo_without_token_is_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app.get("/userinfo").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_token");
}
