use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, StatusCode};
use serde_json::{json, Value as JsonValue};

use crate::error::FetchError;

/// Bodies that are not JSON come back as a JSON string.
pub fn parse_body(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    proxy_url: Option<String>,
}

impl Fetcher {
    pub fn new(timeout: Duration, proxy_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("finboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client, proxy_url })
    }

    /// Direct GET first; on any failure, one POST of `{url}` to the proxy.
    pub async fn fetch_json(&self, url: &str) -> std::result::Result<JsonValue, FetchError> {
        let direct_err = match self.fetch_direct(url).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let Some(proxy) = self.proxy_url.as_deref() else {
            return Err(direct_err);
        };
        log::warn!("fetch.direct.error url={} err={} fallback=proxy", url, direct_err);
        self.fetch_via_proxy(proxy, url).await
    }

    pub async fn fetch_direct(&self, url: &str) -> std::result::Result<JsonValue, FetchError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::status(resp.status()));
        }
        let text = resp.text().await?;
        Ok(parse_body(&text))
    }

    async fn fetch_via_proxy(&self, proxy: &str, url: &str) -> std::result::Result<JsonValue, FetchError> {
        let resp = self
            .client
            .post(proxy)
            .json(&json!({ "url": url }))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FetchError::Proxy {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(parse_body(&text))
    }

    /// Upstream call made on behalf of the proxy endpoint: status and body are
    /// returned as received, whatever the status.
    pub async fn upstream(&self, url: &str) -> std::result::Result<(StatusCode, String), reqwest::Error> {
        let resp = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        Ok((status, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxStatus, routing::get, routing::post, Json, Router};

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/json", get(|| async { Json(json!({"price": 1.5})) }))
            .route("/text", get(|| async { "plain body" }))
            .route("/broken", get(|| async { (AxStatus::INTERNAL_SERVER_ERROR, "down") }))
            .route(
                "/api/proxy",
                post(|Json(body): Json<JsonValue>| async move { Json(json!({"via": "proxy", "url": body["url"]})) }),
            )
            .route(
                "/bad-proxy",
                post(|| async { (AxStatus::BAD_GATEWAY, "upstream unreachable") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_body("[1,2]"), json!([1, 2]));
        assert_eq!(parse_body("hello"), json!("hello"));
    }

    #[tokio::test]
    async fn test_direct_json_and_text() {
        let base = spawn_upstream().await;
        let f = Fetcher::new(Duration::from_secs(5), None).unwrap();
        assert_eq!(f.fetch_json(&format!("{base}/json")).await.unwrap(), json!({"price": 1.5}));
        assert_eq!(f.fetch_json(&format!("{base}/text")).await.unwrap(), json!("plain body"));
    }

    #[tokio::test]
    async fn test_status_error_without_proxy() {
        let base = spawn_upstream().await;
        let f = Fetcher::new(Duration::from_secs(5), None).unwrap();
        let err = f.fetch_json(&format!("{base}/broken")).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 500 Internal Server Error");
    }

    #[tokio::test]
    async fn test_falls_back_to_proxy() {
        let base = spawn_upstream().await;
        let f = Fetcher::new(Duration::from_secs(5), Some(format!("{base}/api/proxy"))).unwrap();
        let url = format!("{base}/broken");
        let v = f.fetch_json(&url).await.unwrap();
        assert_eq!(v, json!({"via": "proxy", "url": url}));
    }

    #[tokio::test]
    async fn test_proxy_failure_message() {
        let base = spawn_upstream().await;
        let f = Fetcher::new(Duration::from_secs(5), Some(format!("{base}/bad-proxy"))).unwrap();
        let err = f.fetch_json(&format!("{base}/broken")).await.unwrap_err();
        assert_eq!(err.to_string(), "Proxy fetch failed 502: upstream unreachable");
    }

    #[tokio::test]
    async fn test_upstream_mirrors_status() {
        let base = spawn_upstream().await;
        let f = Fetcher::new(Duration::from_secs(5), None).unwrap();
        let (status, body) = f.upstream(&format!("{base}/broken")).await.unwrap();
        assert_eq!(status.as_u16(), 500);
        assert_eq!(body, "down");
    }
}
