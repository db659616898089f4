use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// HTTP access to the preview, kept behind a trait so agents can be tested
/// without a server.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn send(&self, method: &str, url: &str) -> Result<ProbeResponse, ProbeError>;

    async fn get(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        self.send("GET", url).await
    }

    async fn head(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        self.send("HEAD", url).await
    }
}

pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(url.to_string())
    } else if err.is_connect() {
        ProbeError::Connection(format!("{url}: {err}"))
    } else {
        ProbeError::Other(format!("{url}: {err}"))
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn send(&self, method: &str, url: &str) -> Result<ProbeResponse, ProbeError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| ProbeError::Other(format!("invalid method {method}: {e}")))?;

        let start = Instant::now();
        let response = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| map_reqwest_error(url, e))?;

        Ok(ProbeResponse {
            status,
            headers,
            body,
            elapsed: start.elapsed(),
        })
    }
}

/// Canned responses keyed by `METHOD url`. Unknown URLs fail with a
/// connection error; a HEAD without its own entry falls back to the GET one.
#[derive(Default)]
pub struct StaticProbe {
    responses: Mutex<HashMap<String, Result<ProbeResponse, ProbeError>>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, status: u16, body: &str) -> Self {
        self.respond("GET", url, status, &[], body, Duration::from_millis(20))
    }

    pub fn respond(
        self,
        method: &str,
        url: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: &str,
        elapsed: Duration,
    ) -> Self {
        let response = ProbeResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
            body: body.to_string(),
            elapsed,
        };
        self.insert(method, url, Ok(response));
        self
    }

    pub fn fail(self, method: &str, url: &str, error: ProbeError) -> Self {
        self.insert(method, url, Err(error));
        self
    }

    fn insert(&self, method: &str, url: &str, response: Result<ProbeResponse, ProbeError>) {
        let key = format!("{} {}", method.to_uppercase(), url);
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, response);
    }
}

#[async_trait]
impl HttpProbe for StaticProbe {
    async fn send(&self, method: &str, url: &str) -> Result<ProbeResponse, ProbeError> {
        let responses = self.responses.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let method = method.to_uppercase();
        let found = responses.get(&format!("{method} {url}")).or_else(|| {
            (method == "HEAD")
                .then(|| responses.get(&format!("GET {url}")))
                .flatten()
        });

        match found {
            Some(Ok(response)) if method == "HEAD" => Ok(ProbeResponse {
                body: String::new(),
                ..response.clone()
            }),
            Some(result) => result.clone(),
            None => Err(ProbeError::Connection(format!("{url}: connection refused"))),
        }
    }
}
