use crate::models::{ProbeJob, ProbeOutcome, ProbeStatus, RESPONSE_CAPTURE_BYTES, STOP_ERROR_MSG};
use crate::probes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default wall-clock budget for one probe, connect included.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes single HTTP probes, with per-proxy client reuse.
///
/// Clients are cached for the lifetime of the process keyed by proxy
/// URL; the empty key is the direct (no proxy) client.
pub struct ProbeExecutor {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    timeout: Duration,
}

impl ProbeExecutor {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Run one probe. Transport, protocol and parse failures all come
    /// back as a fail outcome; this never errors across the worker
    /// boundary. The cancel token is honored at connect, header and
    /// body-read time.
    pub async fn execute(&self, job: &ProbeJob, cancel: &CancellationToken) -> ProbeOutcome {
        let kind = job.endpoint_kind;
        let request = probes::build_probe(&job.base_url, &job.api_key, &job.model_name, kind);

        let client = match self.client_for(job.proxy_url.as_deref()) {
            Ok(c) => c,
            Err(e) => return ProbeOutcome::failure(kind, 0, e),
        };

        let mut builder = client
            .post(&request.url)
            .timeout(self.timeout)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let started = Instant::now();

        let response = tokio::select! {
            r = builder.send() => r,
            _ = cancel.cancelled() => {
                return ProbeOutcome::failure(kind, started.elapsed().as_millis() as i64, STOP_ERROR_MSG);
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let latency = started.elapsed().as_millis() as i64;
                return ProbeOutcome::failure(kind, latency, transport_error_msg(&e));
            }
        };

        let http_status = response.status().as_u16();

        let body = tokio::select! {
            b = response.text() => b,
            _ = cancel.cancelled() => {
                return ProbeOutcome::failure(kind, started.elapsed().as_millis() as i64, STOP_ERROR_MSG);
            }
        };

        let latency = started.elapsed().as_millis() as i64;
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                let mut outcome = ProbeOutcome::failure(kind, latency, transport_error_msg(&e));
                outcome.http_status = Some(http_status);
                return outcome;
            }
        };

        match probes::parse_outcome(kind, http_status, &body) {
            Ok(()) => ProbeOutcome {
                kind,
                status: ProbeStatus::Success,
                latency_ms: latency,
                http_status: Some(http_status),
                error_msg: None,
                response_content: Some(probes::truncate_utf8(&body, RESPONSE_CAPTURE_BYTES)),
            },
            Err(error_msg) => {
                let mut outcome = ProbeOutcome::failure(kind, latency, error_msg);
                outcome.http_status = Some(http_status);
                outcome
            }
        }
    }

    fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, String> {
        let key = proxy_url.unwrap_or("").to_string();
        let mut clients = self.clients.lock().expect("client cache poisoned");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_proxied_client(proxy_url)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ProbeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a client honoring the channel's proxy rules; also used by the
/// catalog sync, which shares the proxy semantics but not the cache.
pub fn build_proxied_client(proxy_url: Option<&str>) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder();
    if let Some(url) = proxy_url {
        let normalized = normalize_proxy_url(url)?;
        let proxy = reqwest::Proxy::all(&normalized)
            .map_err(|e| format!("invalid proxy url: {}", e))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| format!("http client build failed: {}", e))
}

/// Accepts http(s), socks5, socks4 and the bare `socks://` alias
/// (treated as socks5).
fn normalize_proxy_url(url: &str) -> Result<String, String> {
    let lower = url.to_lowercase();
    if lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("socks5://")
        || lower.starts_with("socks4://")
    {
        return Ok(url.to_string());
    }
    if let Some(rest) = lower.strip_prefix("socks://") {
        return Ok(format!("socks5://{}", rest));
    }
    Err(format!("unsupported proxy scheme: {}", url))
}

/// Collapse reqwest's error tree into the short canonical strings the
/// dashboard shows.
fn transport_error_msg(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        return "timeout".to_string();
    }
    let detail = format!("{:?}", e).to_lowercase();
    if detail.contains("dns") {
        return "dns failure".to_string();
    }
    if detail.contains("certificate") || detail.contains("tls") || detail.contains("ssl") {
        return "tls error".to_string();
    }
    if e.is_connect() || detail.contains("connection refused") {
        return "connection refused".to_string();
    }
    // Fall back to reqwest's terse description
    let mut msg = e.to_string();
    msg.truncate(200);
    msg
}

// ============================================================
// Tests
// ============================================================
