//! HTTP plumbing between the SDK and the attribution/validation services.
use async_trait::async_trait;
use reqwest::{header, Method, StatusCode, Url};

use crate::Result;

/// A single request issued by the SDK.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method. The SDK only uses `GET` and `POST`.
    pub method: Method,
    /// Fully-built URL, including query parameters.
    pub url: Url,
    /// Value for the `Authorization` header, if any.
    pub authorization: Option<String>,
    /// JSON body, sent with `Content-Type: application/json`.
    pub json: Option<serde_json::Value>,
}

impl HttpRequest {
    pub(crate) fn get(url: Url) -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            url,
            authorization: None,
            json: None,
        }
    }

    pub(crate) fn post_json(url: Url, json: serde_json::Value) -> HttpRequest {
        HttpRequest {
            method: Method::POST,
            url,
            authorization: None,
            json: Some(json),
        }
    }

    pub(crate) fn with_authorization(mut self, authorization: impl Into<String>) -> HttpRequest {
        self.authorization = Some(authorization.into());
        self
    }
}

/// Status and raw body of a response. Non-success statuses are not errors at this level.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// Parse the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Sends [`HttpRequest`]s. Only transport failures are errors; any received response is `Ok`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and return the received response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        (**self).send(request).await
    }
}

/// The default [`HttpTransport`], backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a default `reqwest` client.
    pub fn new() -> Self {
        ReqwestTransport::default()
    }

    /// Create a transport using a preconfigured `reqwest` client (proxies, TLS, timeouts, etc.).
    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        log::trace!(target: "insert_affiliate", "{} {}", request.method, request.url);

        let mut builder = self.client.request(request.method, request.url);
        if let Some(authorization) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        if let Some(json) = &request.json {
            builder = builder.json(json);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::{
        collections::VecDeque,
        sync::Mutex,
    };

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::{HttpRequest, HttpResponse, HttpTransport};
    use crate::{Error, Result};

    /// Records every request and answers with queued responses matched by URL path prefix.
    /// Unmatched requests get `404 Route not found`.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        routes: Mutex<Vec<(String, VecDeque<Result<HttpResponse>>)>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            FakeTransport::default()
        }

        pub fn respond(&self, path_prefix: &str, status: u16, body: &str) {
            self.push(
                path_prefix,
                Ok(HttpResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    body: body.to_owned(),
                }),
            );
        }

        pub fn fail(&self, path_prefix: &str) {
            self.push(
                path_prefix,
                Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            );
        }

        fn push(&self, path_prefix: &str, response: Result<HttpResponse>) {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|(prefix, _)| prefix == path_prefix) {
                Some((_, queue)) => queue.push_back(response),
                None => routes.push((path_prefix.to_owned(), VecDeque::from([response]))),
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn requests_to(&self, path_prefix: &str) -> Vec<HttpRequest> {
            self.requests()
                .into_iter()
                .filter(|request| request.url.path().starts_with(path_prefix))
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let path = request.url.path().to_owned();
            self.requests.lock().unwrap().push(request);

            let mut routes = self.routes.lock().unwrap();
            // Longest prefix wins, so `/v1/affiliateReturnOfferCode/ACME` beats
            // `/v1/affiliateReturnOfferCode`.
            let route = routes
                .iter_mut()
                .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());

            match route.and_then(|(_, queue)| queue.pop_front()) {
                Some(response) => response,
                None => Ok(HttpResponse {
                    status: StatusCode::NOT_FOUND,
                    body: "Route not found".to_owned(),
                }),
            }
        }
    }
}
