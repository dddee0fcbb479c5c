//! Test helper functions and utilities.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_api::{AppState, build_app};
use tally_billing::sign_payload;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Start an API server for testing and return its address.
pub async fn start_test_server(state: Arc<AppState>) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = build_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Ok((addr, handle))
}

/// Drive one request through `app` without a socket.
pub async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub fn post_json<T: Serialize>(uri: &str, body: &T) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn post_empty(uri: &str) -> Request<Body> {
    Request::post(uri).body(Body::empty()).unwrap()
}

/// A Stripe webhook delivery signed with `secret`.
pub fn stripe_webhook(body: Vec<u8>, secret: &str) -> Request<Body> {
    let signature = sign_payload(&body, secret, Utc::now().timestamp()).unwrap();
    Request::post("/api/v1/webhooks/stripe")
        .header("content-type", "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

/// HTTP client for API testing over a real socket.
pub struct ApiTestClient {
    client: Client,
    base_url: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: Client::new(),
            base_url: format!("http://{}", addr),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(format!("{}{}", self.base_url, path)).send().await
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
    }

    pub async fn health(&self) -> reqwest::Result<bool> {
        Ok(self.get("/health").await?.status().is_success())
    }
}
