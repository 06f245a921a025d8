//! One accepted socket, one request, one response.
//!
//! Each connection runs as its own task and lives for exactly one
//! HTTP request-response cycle (no keep-alive). The handler parses the
//! request head line by line, dispatches GETs to the serve strategies
//! (see `serve`) and POSTs to the signed upload path, and on the way
//! out unconditionally drops any download it started; a dead client
//! must never leave a writer behind on a cache file.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cpcache_core::download::DownloadHandle;
use cpcache_core::{MetadataDbError, RegistryError};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time;

use crate::app::App;
use crate::http::{self, Method, ResponseHead, Status};
use crate::request::RequestHeaders;

const MAX_LINE_BYTES: usize = 8192;
const MAX_HEADER_FIELDS: usize = 100;

/// Uploads larger than this are rejected with 413.
const MAX_UPLOAD_BYTES: u64 = 500_000;

/// The whole upload body must arrive within this deadline.
const UPLOAD_BODY_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a request could not be served to completion.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request head was not parseable HTTP. Closed without a
    /// response.
    #[error("malformed request")]
    Malformed,
    /// The client went away mid-response.
    #[error("client closed the connection mid-response")]
    ClientDisconnected,
    /// Socket I/O failed.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The download registry failed or timed out.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// The metadata database failed.
    #[error("metadata database error: {0}")]
    MetadataDb(#[from] MetadataDbError),
    /// A cache file could not be opened or read.
    #[error("cache file {path}: {source}")]
    CacheFile {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The writer feeding a tailed file died; the response was cut
    /// short.
    #[error("response truncated: upstream writer stalled")]
    Truncated,
    /// An internal invariant failed.
    #[error("{0}")]
    Internal(String),
}

impl RequestError {
    /// Whether the client should get a 500 (provided no response head
    /// has been written yet). Parse failures and dead sockets get
    /// nothing.
    fn warrants_error_response(&self) -> bool {
        !matches!(
            self,
            RequestError::Malformed | RequestError::ClientDisconnected | RequestError::Io(_)
        )
    }
}

/// State for one accepted connection.
pub struct Connection {
    pub(crate) app: App,
    pub(crate) io: BufStream<TcpStream>,
    pub(crate) peer: SocketAddr,
    pub(crate) sent_header: bool,
    /// The download this connection started, if any. Dropped, and
    /// thereby aborted, when the connection ends.
    pub(crate) download: Option<DownloadHandle>,
}

impl Connection {
    /// Wraps an accepted socket.
    pub fn new(app: App, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            app,
            io: BufStream::new(stream),
            peer,
            sent_header: false,
            download: None,
        }
    }

    /// Runs the request-response cycle to completion and closes the
    /// socket. Never panics the surrounding task on request errors.
    pub async fn serve(mut self) {
        let result = self.process().await;

        match &result {
            Ok(()) => tracing::debug!(peer = %self.peer, "request completed"),
            Err(RequestError::Malformed) => {
                tracing::debug!(peer = %self.peer, "malformed request; closing")
            }
            Err(RequestError::ClientDisconnected) => {
                tracing::info!(peer = %self.peer, "client closed connection before response finished")
            }
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "request failed");
                if !self.sent_header && error.warrants_error_response() {
                    let _ = self
                        .send_text(Status::InternalServerError, "internal server error\n")
                        .await;
                }
            }
        }

        let _ = self.io.shutdown().await;
        // Dropping `self.download` here aborts any download this
        // connection owned; the registry releases the key through the
        // task's liveness guard.
    }

    async fn process(&mut self) -> Result<(), RequestError> {
        let (method, target, fields) = self.read_request_head().await?;
        let headers = RequestHeaders::from_fields(&fields);
        tracing::debug!(peer = %self.peer, ?method, path = %target, "request");

        match method {
            Method::Get => self.dispatch_get(&target, &headers).await,
            Method::Post => self.handle_post(&target, &headers).await,
        }
    }

    async fn read_request_head(
        &mut self,
    ) -> Result<(Method, String, Vec<(String, String)>), RequestError> {
        let request_line = self.read_line().await?;
        let (method, target) =
            http::parse_request_line(&request_line).ok_or(RequestError::Malformed)?;

        let mut fields = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if fields.len() >= MAX_HEADER_FIELDS {
                return Err(RequestError::Malformed);
            }
            let field = http::parse_header_field(&line).ok_or(RequestError::Malformed)?;
            fields.push(field);
        }
        Ok((method, target, fields))
    }

    async fn read_line(&mut self) -> Result<String, RequestError> {
        let mut line = String::new();
        let read = self.io.read_line(&mut line).await?;
        if read == 0 || line.len() > MAX_LINE_BYTES {
            return Err(RequestError::Malformed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn dispatch_get(
        &mut self,
        target: &str,
        headers: &RequestHeaders,
    ) -> Result<(), RequestError> {
        match target {
            "/" => return self.send_text(Status::Ok, "OK\n").await,
            "/robots.txt" => {
                return self
                    .send_text(Status::Ok, "User-agent: *\nDisallow: /\n")
                    .await;
            }
            "/favicon.ico" => return self.send_text(Status::NotFound, "not found\n").await,
            _ => {}
        }

        let key = match cpcache_core::CacheKey::from_request_target(target) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(peer = %self.peer, %error, "rejected request path");
                return self.send_text(Status::NotFound, "not found\n").await;
            }
        };

        if key.is_database() {
            // Database indexes are small and change constantly; they are
            // never cached, only redirected.
            return self.redirect_to_mirror(&key).await;
        }

        self.serve_package(key, headers.range_start).await
    }

    async fn handle_post(
        &mut self,
        target: &str,
        headers: &RequestHeaders,
    ) -> Result<(), RequestError> {
        let Some(recv) = self.app.config.recv_packages.clone() else {
            tracing::warn!(peer = %self.peer, "upload rejected: no shared secret configured");
            return self.send_text(Status::Forbidden, "forbidden\n").await;
        };

        let Some(hostname) = decode_hostname(target) else {
            tracing::warn!(peer = %self.peer, path = %target, "upload rejected: bad hostname");
            return self.send_text(Status::Forbidden, "forbidden\n").await;
        };

        let Some(content_length) = headers.content_length else {
            return Err(RequestError::Malformed);
        };
        if content_length > MAX_UPLOAD_BYTES {
            return self
                .send_text(Status::PayloadTooLarge, "payload too large\n")
                .await;
        }

        if headers.expect_continue {
            self.io
                .write_all(http::CONTINUE_RESPONSE.as_bytes())
                .await?;
            self.io.flush().await?;
        }

        let mut body = vec![0u8; content_length as usize];
        match time::timeout(UPLOAD_BODY_TIMEOUT, self.io.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => return Err(RequestError::Io(error)),
            Err(_) => {
                tracing::warn!(peer = %self.peer, "upload body did not arrive in time");
                return Err(RequestError::Malformed);
            }
        }

        let (Some(signature), Some(timestamp)) = (&headers.signature, headers.timestamp) else {
            tracing::warn!(peer = %self.peer, "upload rejected: missing signature or timestamp");
            return self.send_text(Status::Forbidden, "forbidden\n").await;
        };
        let accepted = cpcache_core::auth::verify_signed_body(
            &recv.secret_bytes(),
            &body,
            signature,
            timestamp,
            now_unix(),
        );
        if !accepted {
            tracing::warn!(peer = %self.peer, %hostname, "upload rejected: bad signature");
            return self.send_text(Status::Forbidden, "forbidden\n").await;
        }

        let dir = self.app.config.wanted_packages_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| RequestError::CacheFile {
                path: dir.clone(),
                source,
            })?;
        let path = dir.join(&hostname);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|source| RequestError::CacheFile {
                path: path.clone(),
                source,
            })?;

        tracing::info!(peer = %self.peer, %hostname, bytes = body.len(), "wanted packages stored");
        self.send_text(Status::Ok, "OK\n").await
    }

    /// Writes a response head followed by a small text body.
    pub(crate) async fn send_text(
        &mut self,
        status: Status,
        body: &str,
    ) -> Result<(), RequestError> {
        let head = ResponseHead::new(status)
            .header("Content-Type", "text/plain")
            .content_length(body.len() as u64);
        self.write_head(&head).await?;
        self.io
            .write_all(body.as_bytes())
            .await
            .map_err(|_| RequestError::ClientDisconnected)?;
        self.io
            .flush()
            .await
            .map_err(|_| RequestError::ClientDisconnected)?;
        Ok(())
    }

    /// 301 to the currently preferred mirror, used for database files
    /// and for ranged requests of files we do not have.
    pub(crate) async fn redirect_to_mirror(
        &mut self,
        key: &cpcache_core::CacheKey,
    ) -> Result<(), RequestError> {
        let Some(mirror) = self.app.mirrors.first() else {
            return Err(RequestError::Internal("no mirrors available".to_string()));
        };
        let location = format!("{}/{}", mirror.trim_end_matches('/'), key.as_str());
        tracing::debug!(peer = %self.peer, %location, "redirecting to mirror");
        let head = ResponseHead::new(Status::MovedPermanently)
            .header("Location", location)
            .content_length(0);
        self.write_head(&head).await?;
        self.io
            .flush()
            .await
            .map_err(|_| RequestError::ClientDisconnected)?;
        Ok(())
    }

    pub(crate) async fn write_head(&mut self, head: &ResponseHead) -> Result<(), RequestError> {
        self.io
            .write_all(head.render().as_bytes())
            .await
            .map_err(|_| RequestError::ClientDisconnected)?;
        self.sent_header = true;
        Ok(())
    }
}

/// Decodes and sanitizes the hostname from a `POST /<hostname>` target.
/// The result is used as a file name, so anything that could leave the
/// wanted-packages directory is rejected.
fn decode_hostname(target: &str) -> Option<String> {
    let raw = target.trim_start_matches('/');
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    let hostname = decoded.to_string();
    let acceptable = !hostname.is_empty()
        && hostname != "."
        && hostname != ".."
        && !hostname.contains(['/', '\\', '\0'])
        && !hostname.chars().any(char::is_control);
    acceptable.then_some(hostname)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_decoding_rejects_escapes() {
        assert_eq!(decode_hostname("/host1"), Some("host1".to_string()));
        assert_eq!(
            decode_hostname("/web-01.example.org"),
            Some("web-01.example.org".to_string())
        );
        assert_eq!(decode_hostname("/"), None);
        assert_eq!(decode_hostname("/.."), None);
        assert_eq!(decode_hostname("/a/b"), None);
        assert_eq!(decode_hostname("/%2e%2e"), None);
        assert_eq!(decode_hostname("/a%2Fb"), None);
        assert_eq!(decode_hostname("/host%00"), None);
    }
}
