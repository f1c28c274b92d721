//! Minimal JSON-over-HTTP client shared by the REST backends.

use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::TrackerError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("taskwright/", env!("CARGO_PKG_VERSION"));

pub(crate) struct RestClient {
    http: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
}

impl RestClient {
    /// `authorization` is the full header value (`Bearer ...`, `token ...`).
    pub fn new(base_url: &str, authorization: Option<String>) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(auth) = &self.authorization {
            req = req.header("Authorization", auth);
        }
        req
    }

    /// Send and map error statuses to [`TrackerError::Status`].
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, TrackerError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let quota_spent = resp
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|v| v.as_bytes() == b"0");
            let body = resp.text().await.unwrap_or_default();
            let mut message = if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            if quota_spent {
                message = format!("rate limit exhausted: {}", message);
            }
            return Err(TrackerError::status(status.as_u16(), message));
        }
        Ok(resp)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TrackerError> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        Ok(resp.json().await?)
    }

    pub async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T, TrackerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.send(self.request(method, path).json(body)).await?;
        Ok(resp.json().await?)
    }

    /// Send a JSON body and ignore the response body.
    pub async fn send_json_unit<B>(&self, method: Method, path: &str, body: &B) -> Result<(), TrackerError>
    where
        B: Serialize + ?Sized,
    {
        self.send(self.request(method, path).json(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), TrackerError> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    /// Status of a bare GET, for endpoints that answer with 204/404 instead of a body.
    pub async fn probe(&self, path: &str) -> Result<StatusCode, TrackerError> {
        let resp = self.request(Method::GET, path).send().await?;
        Ok(resp.status())
    }

    /// Fetch every page of a list endpoint.
    ///
    /// `size_param` is the page-size query parameter (`per_page` or `limit`).
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        size_param: &str,
        page_size: usize,
    ) -> Result<Vec<T>, TrackerError> {
        let mut all = Vec::new();
        let size = page_size.to_string();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let req = self
                .request(Method::GET, path)
                .query(query)
                .query(&[(size_param, size.as_str()), ("page", page_str.as_str())]);
            let batch: Vec<T> = self.send(req).await?.json().await?;
            let count = batch.len();
            all.extend(batch);
            if count < page_size {
                break;
            }
            page += 1;
        }
        Ok(all)
    }
}
