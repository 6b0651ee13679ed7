//! Integration tests for the password flow and 401 renewal

use mockito::{Mock, Server, ServerGuard};
use nimbus_client::{auth::PasswordProvider, Client, Error, RequestData};
use reqwest::StatusCode;
use serde_json::Value;

async fn token_mock(server: &mut ServerGuard, token: &str, hits: usize) -> Mock {
    server
        .mock("POST", "/token")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(r#"{{"token":"{}"}}"#, token))
        .expect(hits)
        .create_async()
        .await
}

async fn logged_in_client(server: &mut ServerGuard) -> Client {
    let login = token_mock(server, "abc", 1).await;
    let client = Client::with_base_url(server.url()).unwrap();
    client.authenticate("user@example.com", "secret").await.unwrap();
    login.assert_async().await;
    login.remove_async().await;
    client
}

#[tokio::test]
async fn login_posts_credentials_and_attaches_token() {
    //* Given
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", "/token")
        .match_body(mockito::Matcher::Json(serde_json::json!({
            "email": "user@example.com",
            "password": "secret"
        })))
        .with_status(200)
        .with_body(r#"{"token":"abc"}"#)
        .expect(1)
        .create_async()
        .await;
    let api = server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=abc")
        .with_status(200)
        .with_body(r#"{"mounts":[]}"#)
        .expect(1)
        .create_async()
        .await;
    let client = Client::with_base_url(server.url()).unwrap();

    //* When
    client.authenticate("user@example.com", "secret").await.unwrap();
    let body: Value = client
        .request_json(RequestData::get("/api/v2/mounts"))
        .await
        .unwrap();

    //* Then
    login.assert_async().await;
    api.assert_async().await;
    assert_eq!(body, serde_json::json!({"mounts": []}));
    assert_eq!(client.token().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn login_accepts_capitalized_token_field() {
    //* Given
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"Token":"abc"}"#)
        .create_async()
        .await;
    let client = Client::with_base_url(server.url()).unwrap();

    //* When
    client.authenticate("user@example.com", "secret").await.unwrap();

    //* Then
    assert_eq!(client.token().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn login_rejected_leaves_pipeline_unauthenticated() {
    //* Given
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/token")
        .with_status(401)
        .create_async()
        .await;
    let client = Client::with_base_url(server.url()).unwrap();

    //* When
    let result = client.authenticate("user@example.com", "wrong").await;

    //* Then
    assert!(matches!(
        result,
        Err(Error::InvalidStatus { status, .. }) if status == StatusCode::UNAUTHORIZED
    ));
    assert!(client.pipeline().auth().await.is_none());
}

#[tokio::test]
async fn login_with_empty_token_fails() {
    //* Given
    let mut server = Server::new_async().await;
    token_mock(&mut server, "", 1).await;
    let client = Client::with_base_url(server.url()).unwrap();

    //* When
    let result = client.authenticate("user@example.com", "secret").await;

    //* Then
    assert!(matches!(result, Err(Error::EmptyCredential)));
}

#[tokio::test]
async fn get_after_401_renews_and_retries_once() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 1).await;
    let stale = server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=abc")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=xyz")
        .with_status(200)
        .with_body(r#"{"mounts":["primary"]}"#)
        .expect(1)
        .create_async()
        .await;

    //* When
    let body: Value = client
        .request_json(RequestData::get("/api/v2/mounts"))
        .await
        .unwrap();

    //* Then
    renew.assert_async().await;
    stale.assert_async().await;
    fresh.assert_async().await;
    assert_eq!(body["mounts"][0], "primary");
    assert_eq!(client.token().await.as_deref(), Some("xyz"));
}

#[tokio::test]
async fn head_after_401_renews_and_retries_once() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 1).await;
    let stale = server
        .mock("HEAD", "/api/v2/mounts/primary/files/info")
        .match_header("authorization", "Token token=abc")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let fresh = server
        .mock("HEAD", "/api/v2/mounts/primary/files/info")
        .match_header("authorization", "Token token=xyz")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    //* When
    let response = client
        .execute(RequestData::head("/api/v2/mounts/primary/files/info"))
        .await
        .unwrap();

    //* Then
    assert_eq!(response.status(), StatusCode::OK);
    renew.assert_async().await;
    stale.assert_async().await;
    fresh.assert_async().await;
}

#[tokio::test]
async fn connection_failure_is_not_renewed() {
    //* Given
    let mut server = Server::new_async().await;
    let login = token_mock(&mut server, "abc", 1).await;

    // Reserve a port, then release it so nothing is listening there.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let api_base = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let client = Client::with_base_url(api_base).unwrap();
    let mut provider = PasswordProvider::new("user@example.com", "secret")
        .with_token_endpoint(format!("{}/token", server.url()));
    client.authenticate_with_provider(&mut provider).await.unwrap();

    //* When
    let result = client.execute(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert!(matches!(result, Err(Error::Http(_))));
    login.assert_async().await;
    assert_eq!(client.token().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn post_after_401_renews_without_retry() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 1).await;
    let rejected = server
        .mock("POST", "/api/v2/mounts/primary/files/folder")
        .match_header("authorization", "Token token=abc")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let retried = server
        .mock("POST", "/api/v2/mounts/primary/files/folder")
        .match_header("authorization", "Token token=xyz")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    //* When
    let request = RequestData::post("/api/v2/mounts/primary/files/folder")
        .json(&serde_json::json!({"name": "docs"}))
        .unwrap();
    let result = client.execute(request).await;

    //* Then
    let err = result.unwrap_err();
    assert!(err.is_unauthorized());
    renew.assert_async().await;
    rejected.assert_async().await;
    retried.assert_async().await;
    // The next request uses the renewed token.
    assert_eq!(client.token().await.as_deref(), Some("xyz"));
}

#[tokio::test]
async fn non_401_error_is_not_renewed() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 0).await;
    server
        .mock("GET", "/api/v2/mounts")
        .with_status(403)
        .create_async()
        .await;

    //* When
    let result = client.execute(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert_eq!(result.unwrap_err().status(), Some(StatusCode::FORBIDDEN));
    renew.assert_async().await;
    assert_eq!(client.token().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn failed_renewal_returns_original_401() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = server
        .mock("POST", "/token")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v2/mounts")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    //* When
    let result = client.execute(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert!(result.unwrap_err().is_unauthorized());
    renew.assert_async().await;
    assert_eq!(client.token().await.as_deref(), Some("abc"));
}

#[tokio::test]
async fn second_401_is_returned_without_another_renewal() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 1).await;
    let api = server
        .mock("GET", "/api/v2/mounts")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;

    //* When
    let result = client.execute(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert!(result.unwrap_err().is_unauthorized());
    renew.assert_async().await;
    api.assert_async().await;
}

#[tokio::test]
async fn concurrent_requests_both_recover() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = server
        .mock("POST", "/token")
        .with_status(200)
        .with_body(r#"{"token":"xyz"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/api/v2/mounts/(a|b)$".to_string()))
        .match_header("authorization", "Token token=abc")
        .with_status(401)
        .create_async()
        .await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/api/v2/mounts/(a|b)$".to_string()))
        .match_header("authorization", "Token token=xyz")
        .with_status(200)
        .with_body("{}")
        .expect(2)
        .create_async()
        .await;

    //* When
    let (a, b) = tokio::join!(
        client.request_bytes(RequestData::get("/api/v2/mounts/a")),
        client.request_bytes(RequestData::get("/api/v2/mounts/b")),
    );

    //* Then
    assert!(a.is_ok());
    assert!(b.is_ok());
    renew.assert_async().await;
    assert_eq!(client.token().await.as_deref(), Some("xyz"));
}

#[tokio::test]
async fn static_token_cannot_renew() {
    //* Given
    let mut server = Server::new_async().await;
    let renew = token_mock(&mut server, "xyz", 0).await;
    let api = server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=static")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let client = Client::with_base_url(server.url()).unwrap();
    client.set_token("static").await.unwrap();

    //* When
    let result = client.execute(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert!(result.unwrap_err().is_unauthorized());
    renew.assert_async().await;
    api.assert_async().await;
}

#[tokio::test]
async fn set_token_keeps_password_renewal() {
    //* Given
    let mut server = Server::new_async().await;
    let client = logged_in_client(&mut server).await;
    let renew = token_mock(&mut server, "xyz", 1).await;
    server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=manual")
        .with_status(401)
        .create_async()
        .await;
    server
        .mock("GET", "/api/v2/mounts")
        .match_header("authorization", "Token token=xyz")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    //* When
    client.set_token("manual").await.unwrap();
    let result = client.request_bytes(RequestData::get("/api/v2/mounts")).await;

    //* Then
    assert!(result.is_ok());
    renew.assert_async().await;
}
