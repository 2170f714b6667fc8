use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use relaygate_common::Headers;
use wreq::{Client, Method, Proxy};

/// HTTP method on an outbound upstream request. Every dispatcher call is
/// a POST; GET is kept for completeness and health-scanner probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Per-group forward proxy URL, if the group was configured with one.
    pub proxy: Option<String>,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

/// Classification of a transport-level (non-HTTP-status) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    ConnectionReset,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// The request's own deadline (not the connect/response timeout) was
    /// reached — classified separately so cancellation never mutates
    /// key validity.
    Cancelled,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    stream_idle_timeout: Duration,
    clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(stream_idle_timeout: Duration) -> Self {
        Self {
            stream_idle_timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Per-group client instances are cached by a config-hash key so
    /// groups with distinct forward-proxy settings don't share a pool
    /// instances.
    fn client_for(
        &self,
        config_key: &str,
        proxy: Option<&str>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Client, UpstreamFailure> {
        let mut guard = self.clients.lock().map_err(|_| UpstreamFailure::Transport {
            kind: TransportErrorKind::Other,
            message: "upstream client cache lock poisoned".to_string(),
        })?;
        if let Some(client) = guard.get(config_key) {
            return Ok(client.clone());
        }
        let client = build_client(proxy, connect_timeout, response_timeout, self.stream_idle_timeout)
            .map_err(map_wreq_error)?;
        guard.insert(config_key.to_string(), client.clone());
        Ok(client)
    }
}

fn build_client(
    proxy: Option<&str>,
    connect_timeout: Duration,
    response_timeout: Duration,
    stream_idle_timeout: Duration,
) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(response_timeout)
        .read_timeout(stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            // Connect-timeout floor: never let a group configure something
            // shorter than 30s for establishing the TCP/TLS connection
            // establishing the TCP/TLS connection.
            let connect_timeout = req.connect_timeout.max(Duration::from_secs(30));
            let config_key = format!(
                "{connect_timeout:?}|{:?}|{}",
                req.response_timeout,
                req.proxy.as_deref().unwrap_or("")
            );
            let client = self.client_for(&config_key, req.proxy.as_deref(), connect_timeout, req.response_timeout)?;

            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let mut builder = client.request(method, &req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.stream_idle_timeout).await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());
    let is_success = (200..300).contains(&status);

    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else { break };
            let Ok(chunk) = item else { break };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if message.contains("reset") {
        return TransportErrorKind::ConnectionReset;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}
