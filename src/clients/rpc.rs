//! NooBaa RPC notification client
//!
//! Requests are JSON bodies POSTed to the RPC URL:
//! `{ "api": ..., "method": ..., "params": ..., "auth_token": ... }`.
//! `auth_api.read_auth` validates the credential on connect, and
//! `bucket_api.subscribe_notifications` answers with a chunked stream of
//! newline-delimited JSON notifications that stays open for as long as the
//! subscription lives.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{AbortHandle, Abortable, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lazy, unbounded sequence of notifications for one subscription.
///
/// A broken or closed connection yields exactly one
/// [`Error::ConnectionLost`] and then ends.
pub type NotificationStream = BoxStream<'static, Result<Notification>>;

/// One bucket event as emitted by the RPC service
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Event id assigned by the service, if any
    pub id: Option<String>,
    /// Object key the event is about
    pub key: String,
    /// Event name, e.g. `ObjectCreated:Put`
    pub event_name: Option<String>,
    /// When the event happened
    pub time: Option<DateTime<Utc>>,
    /// Raw payload as received
    pub payload: Value,
}

impl Notification {
    /// Parse one NDJSON line; S3-style `Records` envelopes expand to one
    /// notification per record.
    pub fn parse_line(line: &[u8]) -> Result<Vec<Notification>> {
        let value: Value = serde_json::from_slice(line)?;
        match value.get("Records").and_then(Value::as_array) {
            Some(records) => Ok(records.iter().cloned().map(Self::from_record).collect()),
            None => Ok(vec![Self::from_record(value)]),
        }
    }

    fn from_record(payload: Value) -> Notification {
        let key = str_at(&payload, &["key"])
            .or_else(|| str_at(&payload, &["s3", "object", "key"]))
            .unwrap_or_default()
            .to_string();
        let id = str_at(&payload, &["id"])
            .or_else(|| str_at(&payload, &["eventId"]))
            .map(str::to_string);
        let event_name = str_at(&payload, &["eventName"])
            .or_else(|| str_at(&payload, &["event_name"]))
            .map(str::to_string);
        let time = str_at(&payload, &["eventTime"])
            .or_else(|| str_at(&payload, &["time"]))
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Notification {
            id,
            key,
            event_name,
            time,
            payload,
        }
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, segment| v.get(segment))
        .and_then(Value::as_str)
}

/// Opens authenticated connections to an RPC endpoint
#[async_trait]
pub trait RpcConnector: Send + Sync {
    /// Fails with [`Error::Auth`] for a rejected credential and
    /// [`Error::Network`] for anything transient.
    async fn connect(&self, url: &str, secret: &str) -> Result<Box<dyn RpcConnection>>;
}

/// A live, authenticated RPC connection
#[async_trait]
pub trait RpcConnection: Send {
    /// Start streaming notifications for `bucket`
    async fn subscribe(&mut self, bucket: &str) -> Result<NotificationStream>;

    /// Release the connection; any stream it handed out ends
    async fn close(self: Box<Self>);
}

/// Longest notification line accepted from the service
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// TCP keepalive probing on the subscribe connection.
///
/// A peer that vanishes without closing the socket is detected after
/// `idle + interval * retries` and surfaces as [`Error::ConnectionLost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keepalive {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

impl Keepalive {
    /// Worst-case time to notice a half-open connection
    pub fn detection_time(&self) -> Duration {
        self.idle + self.interval * self.retries
    }
}

/// HTTP transport for the NooBaa RPC API
#[derive(Clone)]
pub struct HttpRpcConnector {
    http: reqwest::Client,
    request_timeout: Duration,
    max_line_length: usize,
}

impl HttpRpcConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Self::with_keepalive(request_timeout, Keepalive::default())
    }

    pub fn with_keepalive(request_timeout: Duration, keepalive: Keepalive) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .tcp_keepalive(keepalive.idle)
            .tcp_keepalive_interval(keepalive.interval)
            .tcp_keepalive_retries(keepalive.retries)
            .build()?;
        Ok(Self {
            http,
            request_timeout,
            max_line_length: MAX_LINE_LENGTH,
        })
    }
}

#[async_trait]
impl RpcConnector for HttpRpcConnector {
    async fn connect(&self, url: &str, secret: &str) -> Result<Box<dyn RpcConnection>> {
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(&rpc_request("auth_api", "read_auth", json!({}), secret))
            .send()
            .await?;
        let body = check_response(response).await?.bytes().await?;
        if let Ok(value) = serde_json::from_slice::<Value>(&body) {
            check_rpc_error(&value)?;
        }

        debug!(url = %url, "Authenticated with NooBaa RPC");
        Ok(Box::new(HttpRpcConnection {
            http: self.http.clone(),
            url: url.to_string(),
            token: secret.to_string(),
            max_line_length: self.max_line_length,
            streams: Vec::new(),
        }))
    }
}

struct HttpRpcConnection {
    http: reqwest::Client,
    url: String,
    token: String,
    max_line_length: usize,
    streams: Vec<AbortHandle>,
}

#[async_trait]
impl RpcConnection for HttpRpcConnection {
    async fn subscribe(&mut self, bucket: &str) -> Result<NotificationStream> {
        let response = self
            .http
            .post(&self.url)
            .json(&rpc_request(
                "bucket_api",
                "subscribe_notifications",
                json!({ "name": bucket }),
                &self.token,
            ))
            .send()
            .await?;
        let response = check_response(response).await?;

        let (handle, registration) = AbortHandle::new_pair();
        self.streams.push(handle);
        let body = response.bytes_stream().map_err(io::Error::other);
        let body = Abortable::new(Box::pin(body), registration);
        Ok(decode_notifications(body, self.max_line_length))
    }

    async fn close(self: Box<Self>) {
        for handle in &self.streams {
            handle.abort();
        }
        debug!(url = %self.url, "Closed NooBaa RPC connection");
    }
}

fn rpc_request(api: &str, method: &str, params: Value, token: &str) -> Value {
    json!({
        "api": api,
        "method": method,
        "params": params,
        "auth_token": token,
    })
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Map a non-success HTTP status from the RPC service to an error
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::auth(format!("{}: {}", status, body.trim()))
        }
        _ => Error::network(format!("{}: {}", status, body.trim())),
    }
}

/// Surface an RPC-level `error` object carried in a 200 response
pub fn check_rpc_error(value: &Value) -> Result<()> {
    let Some(error) = value.get("error") else {
        return Ok(());
    };
    let code = str_at(error, &["rpc_code"]).unwrap_or("UNKNOWN");
    let message = str_at(error, &["message"]).unwrap_or_default();
    match code {
        "UNAUTHORIZED" | "FORBIDDEN" | "NO_SUCH_AUTH" => {
            Err(Error::auth(format!("{}: {}", code, message)))
        }
        _ => Err(Error::network(format!("{}: {}", code, message))),
    }
}

struct DecodeState<S> {
    lines: FramedRead<StreamReader<S, Bytes>, LinesCodec>,
    pending: VecDeque<Notification>,
    max_line_length: usize,
    done: bool,
}

/// Turn a chunked NDJSON body into a [`NotificationStream`].
///
/// Lines longer than `max_line_length` bytes end the stream with
/// [`Error::ConnectionLost`] instead of being buffered.
pub fn decode_notifications<S>(body: S, max_line_length: usize) -> NotificationStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    let state = DecodeState {
        lines: FramedRead::new(
            StreamReader::new(body),
            LinesCodec::new_with_max_length(max_line_length),
        ),
        pending: VecDeque::new(),
        max_line_length,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(notification) = st.pending.pop_front() {
                return Some((Ok(notification), st));
            }
            if st.done {
                return None;
            }
            let lost = match st.lines.next().await {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Notification::parse_line(line.as_bytes()) {
                        Ok(notifications) => st.pending.extend(notifications),
                        Err(e) => warn!(error = %e, "Skipping malformed notification"),
                    }
                    continue;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Error::connection_lost(format!(
                    "notification line exceeds {} bytes",
                    st.max_line_length
                )),
                Some(Err(LinesCodecError::Io(e))) => Error::connection_lost(e.to_string()),
                None => Error::connection_lost("notification stream closed"),
            };
            st.done = true;
            return Some((Err(lost), st));
        }
    })
    .boxed()
}
