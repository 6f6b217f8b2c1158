use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};
use tracing::debug;

use crate::error::ThreeDsError;

/// A simple wrapper on an HTTP client for making requests. Sets sensible defaults such as
/// timeouts and user-agent, and retries requests that never reached the server.
///
/// A request that produced a response, whatever its status, is never retried: the
/// protocol endpoints are not idempotent and a failed step must surface to the caller.
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl Request {
    /// Initializes a new `Request` instance.
    pub(crate) fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_retries,
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("threeds-core/{}", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Sends a request built by `req`/`post`, retrying connection failures.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, ThreeDsError> {
        let Some(template) = request_builder.try_clone() else {
            return execute_request_builder(request_builder)
                .await
                .map_err(Into::into);
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                RequestHandleError::permanent(
                    "<unknown>".to_string(),
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute_request_builder(request_builder).await
        })
        .retry(backoff)
        .when(RequestHandleError::is_retryable)
        .notify(|err: &RequestHandleError, after: Duration| {
            debug!(url = %err.url, error = %err.error, ?after, "retrying request");
        })
        .await
        .map_err(Into::into)
    }
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    error: String,
    retryable: bool,
}

impl RequestHandleError {
    const fn retryable(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: true,
        }
    }

    const fn permanent(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<RequestHandleError> for ThreeDsError {
    fn from(value: RequestHandleError) -> Self {
        Self::NetworkError {
            url: value.url,
            status: None,
            error: value.error,
        }
    }
}

async fn execute_request_builder(
    request_builder: RequestBuilder,
) -> Result<Response, RequestHandleError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestHandleError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    client.execute(request).await.map_err(|err| {
        if err.is_connect() {
            RequestHandleError::retryable(url, format!("request connect error: {err}"))
        } else {
            RequestHandleError::permanent(url, format!("request failed: {err}"))
        }
    })
}
