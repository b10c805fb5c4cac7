use {super::*, serde::de::DeserializeOwned};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// Talks to a coin daemon over JSON-RPC, or plain REST for nodes that expose
/// their mining API that way.
#[derive(Debug)]
pub struct DaemonClient {
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(
        url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = if url.starts_with("http") {
            url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", url.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build daemon HTTP client")?;

        Ok(Self {
            client,
            url,
            username,
            password,
            next_id: AtomicU64::new(1),
        })
    }

    fn authenticated(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    /// Calls `method`, failing when the daemon reports an error.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let response = self.call_raw::<T>(method, params).await?;

        if let Some(error) = response.error {
            bail!("{method} failed: {} (code {})", error.message, error.code);
        }

        response
            .result
            .ok_or_else(|| anyhow!("{method} returned no result"))
    }

    /// Calls `method` where a null result is a valid answer.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let response = self.call_raw::<T>(method, params).await?;

        if let Some(error) = response.error {
            bail!("{method} failed: {} (code {})", error.message, error.code);
        }

        Ok(response.result)
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        debug!("Daemon call {method} #{id}");

        let request = self.authenticated(self.client.post(&self.url)).json(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }));

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to send {method} to {}", self.url))?;

        let status = response.status();

        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read {method} response"))?;

        serde_json::from_str(&body).with_context(|| {
            format!("failed to parse {method} response (HTTP {status}): {body}")
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.url, path.trim_start_matches('/'));

        let response = self
            .authenticated(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("failed to GET {url}"))?;

        ensure!(
            response.status().is_success(),
            "GET {url} failed with status {}",
            response.status()
        );

        response
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))
    }

    /// POSTs `body` and reports whether the node accepted it.
    pub async fn post(&self, path: &str, body: &Value) -> Result<bool> {
        let url = format!("{}/{}", self.url, path.trim_start_matches('/'));

        let response = self
            .authenticated(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to POST {url}"))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("POST {url} failed with status {status}: {body}");
        }

        Ok(status.is_success())
    }
}
