use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, MeterError};

const ERROR_BODY_MAX: usize = 300;

/// Request context: who we are calling (for error labels), tracing id and
/// idempotency key.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub provider: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

impl RequestCtx<'_> {
    fn label(&self) -> &str {
        self.provider.unwrap_or("http")
    }
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| MeterError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("toolmeter/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(ik) = ctx.idempotency_key {
            req = req.header("Idempotency-Key", ik);
        }
        req
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| {
            tracing::warn!(provider = ctx.label(), error = %e, "upstream send failed");
            MeterError::ProviderUnavailable {
                provider: ctx.label().to_string(),
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(map_http_error(ctx.label(), status, retry_after, &body))
    }

    /// POST JSON and decode a JSON reply. Returns the body, the upstream
    /// request id (if any header carried one) and latency in ms.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let resp = self.send(self.request(url, body, headers, ctx), ctx).await?;
        let latency = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
        let status = resp.status();
        let provider_request_id = extract_request_id(resp.headers());

        let parsed = resp
            .json::<R>()
            .await
            .map_err(|e| MeterError::ProviderError {
                provider: ctx.label().to_string(),
                code: status.as_u16().to_string(),
                message: format!("json decode error: {e}"),
            })?;
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON where only the status matters (sinks that reply 202/204).
    pub async fn post_json_ack<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<u16> {
        let resp = self.send(self.request(url, body, headers, ctx), ctx).await?;
        Ok(resp.status().as_u16())
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE channel.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseStream> {
        let req = self
            .request(url, body, headers, ctx)
            .header("Accept", "text/event-stream");
        let resp = self.send(req, ctx).await?;
        let lines = LineStream::new(Box::pin(resp.bytes_stream()), ctx.label());
        Ok(Box::pin(lines))
    }
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 4] = ["x-request-id", "request-id", "x-amzn-requestid", "cf-ray"];
    CANDIDATES
        .iter()
        .filter_map(|k| headers.get(*k))
        .find_map(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// 429 → RateLimited, 5xx → ProviderUnavailable, anything else keeps the
/// upstream status and its `error.message` (or a body excerpt).
fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> MeterError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => MeterError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => MeterError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => MeterError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: upstream_message(body),
        },
    }
}

fn upstream_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let msg = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str())
    });
    truncate(msg.unwrap_or(body), ERROR_BODY_MAX)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

/// Splits a byte stream on `\n`. Bytes are buffered raw so a multi-byte
/// character split across chunks decodes intact.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    provider: String,
    done: bool,
}

impl LineStream {
    fn new(inner: ByteStream, provider: &str) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            provider: provider.to_string(),
            done: false,
        }
    }

    fn take_line(&mut self, end: usize) -> SseLine {
        let mut raw: Vec<u8> = self.buf.drain(..end).collect();
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                return Poll::Ready(Some(Ok(self.take_line(idx + 1))));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    tracing::warn!(provider = %self.provider, error = %e, "sse body read failed");
                    return Poll::Ready(Some(Err(MeterError::ProviderUnavailable {
                        provider: self.provider.clone(),
                    })));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let end = self.buf.len();
                        return Poll::Ready(Some(Ok(self.take_line(end))));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
