use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;
use tracing::debug;

/// Configuration for API client
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
  pub base_url: String,
  pub api_key: Option<String>,
  pub max_concurrent_requests: usize,
  pub max_requests_per_minute: usize,
  pub timeout: Duration,
}

impl Default for ApiClientConfig {
  fn default() -> Self {
    Self {
      base_url: String::new(),
      api_key: None,
      max_concurrent_requests: 16,
      max_requests_per_minute: 600,
      timeout: Duration::from_secs(30),
    }
  }
}

/// Errors surfaced by the client. Retrying is the caller's decision; the
/// client only reports what happened and whether it looks transient.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("request failed with status {status}: {body}")]
  Status { status: StatusCode, body: String },

  #[error("transport error: {0}")]
  Transport(String),

  #[error("invalid response body: {0}")]
  Decode(String),
}

impl ApiError {
  /// Rate limits, server-side errors, and connection problems are worth
  /// retrying; everything else indicates a request that will fail again.
  pub fn is_transient(&self) -> bool {
    match self {
      ApiError::Status { status, .. } => {
        matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
      }
      ApiError::Transport(_) => true,
      ApiError::Decode(_) => false,
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    ApiError::Transport(err.to_string())
  }
}

/// Token bucket for smooth rate limiting
#[derive(Debug)]
struct TokenBucket {
  capacity: f64,
  tokens: f64,
  /// Tokens refilled per second.
  refill_rate: f64,
  last_refill: Instant,
}

impl TokenBucket {
  fn new(capacity: f64, refill_rate: f64) -> Self {
    Self {
      capacity,
      tokens: capacity,
      refill_rate,
      last_refill: Instant::now(),
    }
  }

  /// Try to consume one token, returns Ok(()) if successful, Err(wait_duration) if not
  fn try_consume(&mut self) -> Result<(), Duration> {
    self.refill();

    if self.tokens >= 1.0 {
      self.tokens -= 1.0;
      Ok(())
    } else {
      let wait_seconds = (1.0 - self.tokens) / self.refill_rate;
      Err(Duration::from_secs_f64(wait_seconds))
    }
  }

  fn refill(&mut self) {
    let now = Instant::now();
    let elapsed = now.duration_since(self.last_refill).as_secs_f64();
    self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
    self.last_refill = now;
  }
}

/// Thin wrapper around reqwest shared by the embedding and index clients:
/// caps concurrent requests and smooths the request rate. Retries live in
/// the pipeline, which owns the per-job retry budget.
#[derive(Debug)]
pub struct ApiClient {
  client: Client,
  config: ApiClientConfig,
  concurrent_semaphore: Arc<Semaphore>,
  rate_limiter: Arc<Mutex<TokenBucket>>,
}

impl ApiClient {
  pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
    let client = Client::builder()
      .default_headers({
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
          if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", api_key)) {
            headers.insert(AUTHORIZATION, value);
          }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
      })
      .user_agent("tandem/ApiClient")
      .timeout(config.timeout)
      .build()?;

    let concurrent_semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

    // Allow a burst of up to 10 seconds worth of requests
    let rate = (config.max_requests_per_minute.max(1)) as f64 / 60.0;
    let capacity = (rate * 10.0).max(1.0);
    let rate_limiter = Arc::new(Mutex::new(TokenBucket::new(capacity, rate)));

    Ok(Self {
      client,
      config,
      concurrent_semaphore,
      rate_limiter,
    })
  }

  pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
  where
    Req: Serialize,
    Res: DeserializeOwned,
  {
    self.request_json(Method::POST, path, Some(payload)).await
  }

  pub async fn put_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
  where
    Req: Serialize,
    Res: DeserializeOwned,
  {
    self.request_json(Method::PUT, path, Some(payload)).await
  }

  pub async fn get_json<Res>(&self, path: &str) -> Result<Res, ApiError>
  where
    Res: DeserializeOwned,
  {
    self
      .request_json::<(), Res>(Method::GET, path, None)
      .await
  }

  /// GET where only the status matters (health endpoints return plain text).
  pub async fn get_ok(&self, path: &str) -> Result<(), ApiError> {
    let url = format!("{}{}", self.config.base_url, path);
    self.wait_for_rate_limit().await;
    let _permit = self
      .concurrent_semaphore
      .acquire()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let response = self.client.get(&url).send().await?;
    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      let body = response.text().await.unwrap_or_default();
      Err(ApiError::Status { status, body })
    }
  }

  async fn request_json<Req, Res>(
    &self,
    method: Method,
    path: &str,
    payload: Option<&Req>,
  ) -> Result<Res, ApiError>
  where
    Req: Serialize,
    Res: DeserializeOwned,
  {
    let url = format!("{}{}", self.config.base_url, path);

    self.wait_for_rate_limit().await;

    // Held until the body is fully read so the cap covers the whole exchange.
    let _permit = self
      .concurrent_semaphore
      .acquire()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let mut request = self.client.request(method, &url);
    if let Some(payload) = payload {
      request = request.json(payload);
    }

    let response = request.send().await?;
    let status = response.status();

    if status.is_success() {
      let body = response.bytes().await?;
      serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    } else {
      let body = response.text().await.unwrap_or_default();
      debug!(%status, url, "request failed");
      Err(ApiError::Status { status, body })
    }
  }

  /// Wait until we can make a request without exceeding the rate limit.
  async fn wait_for_rate_limit(&self) {
    loop {
      let wait_duration = {
        let mut limiter = self.rate_limiter.lock().await;
        match limiter.try_consume() {
          Ok(()) => return,
          Err(wait) => wait,
        }
      };

      // Small buffer to avoid tight loops.
      let wait_with_buffer = wait_duration + Duration::from_millis(10);
      if wait_with_buffer > Duration::from_millis(100) {
        debug!(
          "Rate limit: waiting {:?} before next request",
          wait_with_buffer
        );
      }
      sleep(wait_with_buffer).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[derive(Serialize)]
  struct TestRequest {
    message: String,
  }

  #[derive(Deserialize, PartialEq, Debug)]
  struct TestResponse {
    result: String,
  }

  fn test_config(base_url: String) -> ApiClientConfig {
    ApiClientConfig {
      base_url,
      max_requests_per_minute: 6000,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_successful_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/test"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
          "result": "success"
      })))
      .mount(&mock_server)
      .await;

    let client = ApiClient::new(test_config(mock_server.uri())).unwrap();
    let request = TestRequest {
      message: "test".to_string(),
    };

    let response: TestResponse = client.post_json("/test", &request).await.unwrap();
    assert_eq!(response.result, "success");
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/test"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&mock_server)
      .await;

    let client = ApiClient::new(test_config(mock_server.uri())).unwrap();
    let request = TestRequest {
      message: "test".to_string(),
    };

    let err = client
      .post_json::<_, TestResponse>("/test", &request)
      .await
      .unwrap_err();
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_client_error_is_not_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/test"))
      .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
      .mount(&mock_server)
      .await;

    let client = ApiClient::new(test_config(mock_server.uri())).unwrap();
    let request = TestRequest {
      message: "test".to_string(),
    };

    let err = client
      .post_json::<_, TestResponse>("/test", &request)
      .await
      .unwrap_err();
    assert!(!err.is_transient());
    assert!(matches!(
      err,
      ApiError::Status { status, .. } if status.as_u16() == 422
    ));
  }

  #[tokio::test]
  async fn test_no_internal_retry_on_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/test"))
      .respond_with(ResponseTemplate::new(503))
      .expect(1)
      .mount(&mock_server)
      .await;

    let client = ApiClient::new(test_config(mock_server.uri())).unwrap();
    let request = TestRequest {
      message: "test".to_string(),
    };

    let _ = client
      .post_json::<_, TestResponse>("/test", &request)
      .await;
    // Mock expectation of exactly one call is verified on drop.
  }

  #[tokio::test]
  async fn test_api_key_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/test"))
      .and(header("Authorization", "Bearer test_key"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
          "result": "authorized"
      })))
      .mount(&mock_server)
      .await;

    let config = ApiClientConfig {
      base_url: mock_server.uri(),
      api_key: Some("test_key".to_string()),
      max_requests_per_minute: 6000,
      ..Default::default()
    };

    let client = ApiClient::new(config).unwrap();
    let request = TestRequest {
      message: "test".to_string(),
    };

    let response: TestResponse = client.post_json("/test", &request).await.unwrap();
    assert_eq!(response.result, "authorized");
  }

  #[tokio::test]
  async fn test_concurrency_cap_serializes_requests() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
      .and(path("/test"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(serde_json::json!({"result": "ok"}))
          .set_delay(Duration::from_millis(100)),
      )
      .mount(&mock_server)
      .await;

    let config = ApiClientConfig {
      base_url: mock_server.uri(),
      max_concurrent_requests: 1,
      max_requests_per_minute: 6000,
      ..Default::default()
    };
    let client = ApiClient::new(config).unwrap();

    let start = Instant::now();
    let (r1, r2) = tokio::join!(
      client.get_json::<TestResponse>("/test"),
      client.get_json::<TestResponse>("/test")
    );
    let elapsed = start.elapsed();

    assert!(r1.is_ok());
    assert!(r2.is_ok());
    // Two sequential 100ms requests.
    assert!(elapsed >= Duration::from_millis(200));
  }

  #[tokio::test]
  async fn test_get_ok_on_plain_text_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
      .and(path("/readyz"))
      .respond_with(ResponseTemplate::new(200).set_body_string("all shards ready"))
      .mount(&mock_server)
      .await;

    let client = ApiClient::new(test_config(mock_server.uri())).unwrap();
    client.get_ok("/readyz").await.unwrap();
  }
}
