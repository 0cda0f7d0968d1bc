mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::*;
use serde_json::{json, Value};

async fn create_beta(app: &TestApp) -> Value {
    let response = app
        .send(app.admin_request(
            "POST",
            "/admin/tenants",
            Some(json!({ "slug": "beta", "name": "Beta Customers" })),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

async fn userinfo(app: &TestApp, prefix: &str, access_token: &str) -> StatusCode {
    app.send(
        Request::builder()
            .uri(format!("{}/userinfo", prefix))
            .header(header::HOST, HOST)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .status()
}

fn kids(jwks: &Value) -> Vec<String> {
    jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_default_tenant_discovery_at_root() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/openid-configuration").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(header::CACHE_CONTROL));

    let doc = body_json(response).await;
    assert_eq!(doc["issuer"], ISSUER);
    assert_eq!(doc["token_endpoint"], format!("{}/token", ISSUER));
    assert_eq!(doc["jwks_uri"], format!("{}/.well-known/jwks.json", ISSUER));
    assert!(doc["code_challenge_methods_supported"]
        .as_array()
        .unwrap()
        .contains(&json!("S256")));
}

#[tokio::test]
async fn test_jwks_publishes_rsa_signing_key() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/jwks.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    let jwks = body_json(response).await;
    let key = &jwks["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["use"], "sig");
    assert!(key["n"].is_string());
    assert!(key.get("d").is_none());
}

#[tokio::test]
async fn test_path_tenant_has_its_own_issuer_and_keys() {
    let app = TestApp::spawn().await;
    let beta = create_beta(&app).await;
    assert_eq!(beta["issuer"], format!("{}/beta", ISSUER));

    let doc = body_json(app.get("/beta/.well-known/openid-configuration").await).await;
    assert_eq!(doc["issuer"], format!("{}/beta", ISSUER));
    assert_eq!(doc["authorization_endpoint"], format!("{}/beta/authorize", ISSUER));

    let root_kids = kids(&body_json(app.get("/.well-known/jwks.json").await).await);
    let beta_kids = kids(&body_json(app.get("/beta/.well-known/jwks.json").await).await);
    assert!(root_kids.iter().all(|kid| !beta_kids.contains(kid)));
}

#[tokio::test]
async fn test_token_from_one_tenant_is_rejected_by_another() {
    let app = TestApp::spawn().await;
    create_beta(&app).await;
    let tokens = app.obtain_tokens().await;
    let access_token = tokens["access_token"].as_str().unwrap();

    assert_eq!(userinfo(&app, "", access_token).await, StatusCode::OK);
    assert_eq!(
        userinfo(&app, "/beta", access_token).await,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_default_tenant_clients_are_unknown_to_other_tenants() {
    let app = TestApp::spawn().await;
    create_beta(&app).await;

    let response = app
        .get(&authorize_uri("/beta", &app.first_party.client, &[]))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_unknown_tenant_slug_is_bad_request() {
    let app = TestApp::spawn().await;

    let response = app.get("/nobody/.well-known/openid-configuration").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_host_is_bad_request() {
    let app = TestApp::spawn().await;

    let response = app
        .send(
            Request::builder()
                .uri("/.well-known/openid-configuration")
                .header(header::HOST, "unknown.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_key_rotation_keeps_outstanding_tokens_valid() {
    let app = TestApp::spawn().await;
    let tokens = app.obtain_tokens().await;
    let old_token = tokens["access_token"].as_str().unwrap().to_string();
    let before = kids(&body_json(app.get("/.well-known/jwks.json").await).await);

    let uri = format!(
        "/admin/tenants/{}/keys/rotate",
        app.tenant.tenant.tenant_id
    );
    let response = app.send(app.admin_request("POST", &uri, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let new_kid = body_json(response).await["kid"].as_str().unwrap().to_string();

    let after = kids(&body_json(app.get("/.well-known/jwks.json").await).await);
    assert_eq!(after.len(), 2);
    assert!(after.contains(&new_kid));
    assert!(after.contains(&before[0]));

    assert_eq!(userinfo(&app, "", &old_token).await, StatusCode::OK);

    let fresh = app.obtain_tokens().await;
    let header = jsonwebtoken::decode_header(fresh["id_token"].as_str().unwrap()).unwrap();
    assert_eq!(header.kid.as_deref(), Some(new_kid.as_str()));
}

async fn beta_client(app: &TestApp, beta: &Value) -> (String, String) {
    let uri = format!("/admin/tenants/{}/clients", beta["tenant_id"].as_str().unwrap());
    let response = app
        .send(app.admin_request(
            "POST",
            &uri,
            Some(json!({
                "name": "Beta app",
                "client_type": "confidential",
                "redirect_uris": [REDIRECT_URI],
                "first_party": true
            })),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    (
        created["client_id"].as_str().unwrap().to_string(),
        created["client_secret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_code_from_one_tenant_is_rejected_by_another() {
    let app = TestApp::spawn().await;
    let beta = create_beta(&app).await;
    let (client_id, secret) = beta_client(&app, &beta).await;
    let code = app.obtain_code(&[]).await;

    let response = app
        .post_form(
            "/beta/token",
            &[],
            Some(&basic_auth(&client_id, &secret)),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    // Default-tenant credentials are unknown to beta.
    let response = app
        .post_form(
            "/beta/token",
            &[],
            Some(&basic_auth(&app.first_party.client.client_id, &app.first_party.secret)),
            &[
                ("grant_type", "authorization_code"),
                ("code", &code),
                ("redirect_uri", REDIRECT_URI),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_client");

    // Beta could not see the code, so it is still redeemable at home.
    let response = app.exchange_code(&code).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_refresh_token_from_one_tenant_is_rejected_by_another() {
    let app = TestApp::spawn().await;
    let beta = create_beta(&app).await;
    let (client_id, secret) = beta_client(&app, &beta).await;
    let code = app.obtain_code(&[("scope", "openid offline_access")]).await;
    let tokens = body_json(app.exchange_code(&code).await).await;
    let refresh_token = tokens["refresh_token"].as_str().unwrap();

    let response = app
        .post_form(
            "/beta/token",
            &[],
            Some(&basic_auth(&client_id, &secret)),
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    let basic = basic_auth(&app.first_party.client.client_id, &app.first_party.secret);
    let response = app
        .post_form(
            "/token",
            &[],
            Some(&basic),
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
