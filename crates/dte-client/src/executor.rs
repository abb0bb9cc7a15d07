use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dte_core::config::EngineConfig;
use dte_core::error::AppError;
use dte_core::job::{HttpMethod, JobTarget};
use dte_core::traits::{ExecutionContext, Executor};
use dte_core::util::compute_hash;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use url::Url;

/// Executor backed by reqwest.
///
/// One client per egress route (direct, or per proxy address) is built
/// lazily and reused. SSRF protection is **enabled** by default: requests
/// to private/reserved IP ranges are refused. Use
/// [`allow_private_urls`](Self::allow_private_urls) to turn it off when the
/// operator controls every target.
#[derive(Clone)]
pub struct ReqwestExecutor {
    user_agent: String,
    timeout: Duration,
    ssrf_protection: bool,
    download_root: PathBuf,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl ReqwestExecutor {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let executor = Self {
            user_agent: user_agent.into(),
            timeout,
            ssrf_protection: true,
            download_root: PathBuf::from("downloads"),
            clients: Arc::new(Mutex::new(HashMap::new())),
        };
        // Fail at startup rather than on the first job.
        executor.client_for(None)?;
        Ok(executor)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, AppError> {
        Self::new(&config.user_agent, config.worker.fetch_timeout)
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// Directory that `FileDownload` destinations are resolved against.
    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = root.into();
        self
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, AppError> {
        let key = proxy.map(str::to_string);
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned client cache");
            poisoned.into_inner()
        });
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout);
        if let Some(address) = proxy {
            let proxy = reqwest::Proxy::all(address).map_err(|e| {
                AppError::ConfigError(format!("Invalid proxy address '{address}': {e}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        ctx: &ExecutionContext,
    ) -> Result<Response, AppError> {
        let response = request
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, ctx.timeout))?;

        match classify_status(response.status(), response.headers(), url) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    async fn fetch_page(
        &self,
        client: &Client,
        url: &str,
        headers: &BTreeMap<String, String>,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, AppError> {
        let request = with_headers(client.get(url), headers);
        let response = self.send(request, url, ctx).await?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = content_type(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, ctx.timeout))?;

        Ok(serde_json::json!({
            "status": status,
            "url": final_url,
            "content_type": content_type,
            "content_hash": compute_hash(&body),
            "body": body,
        }))
    }

    async fn call_api(
        &self,
        client: &Client,
        url: &str,
        method: HttpMethod,
        body: Option<&serde_json::Value>,
        headers: &BTreeMap<String, String>,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, AppError> {
        let mut request = with_headers(client.request(to_reqwest_method(method), url), headers);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request, url, ctx).await?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, ctx.timeout))?;
        // Non-JSON bodies are kept verbatim as a string.
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        Ok(serde_json::json!({
            "status": status,
            "body": body,
        }))
    }

    async fn download(
        &self,
        client: &Client,
        url: &str,
        destination: &Path,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, AppError> {
        let response = self.send(client.get(url), url, ctx).await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, ctx.timeout))?;

        let path = self.download_root.join(destination);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::InfrastructureError(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            AppError::InfrastructureError(format!("Cannot write {}: {e}", path.display()))
        })?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Download stored");
        Ok(serde_json::json!({
            "status": status,
            "path": path.display().to_string(),
            "bytes": bytes.len(),
            "sha256": compute_hash(&bytes),
        }))
    }
}

impl Executor for ReqwestExecutor {
    async fn execute(
        &self,
        target: &JobTarget,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, AppError> {
        let url = target.url();
        if self.ssrf_protection {
            validate_url(url).await?;
        }
        let client = self.client_for(ctx.proxy.as_deref())?;

        match target {
            JobTarget::HttpFetch { headers, .. } => self.fetch_page(&client, url, headers, ctx).await,
            JobTarget::ApiCall {
                method,
                body,
                headers,
                ..
            } => {
                self.call_api(&client, url, *method, body.as_ref(), headers, ctx)
                    .await
            }
            JobTarget::FileDownload { destination, .. } => {
                self.download(&client, url, destination, ctx).await
            }
        }
    }
}

fn with_headers(mut request: RequestBuilder, headers: &BTreeMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status to the error the retry policy expects.
///
/// 429 is a remote rate limit; 408 and 5xx are transient; every other
/// non-2xx status is a permanent target error.
fn classify_status(status: StatusCode, headers: &HeaderMap, url: &str) -> Option<AppError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    Some(match code {
        429 => AppError::RemoteRateLimited {
            retry_after: parse_retry_after(headers, Utc::now()),
        },
        408 | 500..=599 => AppError::TransientNetworkError(format!("HTTP {code} for {url}")),
        _ => AppError::PermanentTargetError(format!("HTTP {code} for {url}")),
    })
}

/// `Retry-After` as either delta-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_builder() || e.is_redirect() {
        AppError::PermanentTargetError(e.to_string())
    } else if e.is_connect() {
        AppError::TransientNetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::TransientNetworkError(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url)
        .map_err(|e| AppError::PermanentTargetError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::PermanentTargetError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::PermanentTargetError("URL has no host".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::PermanentTargetError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            AppError::TransientNetworkError(format!("DNS resolution failed for {host}: {e}"))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::TransientNetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::PermanentTargetError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
