//! Test support: an in-process fake mirror and a raw HTTP/1.1 client.
//!
//! The mirror is a minimal std-thread HTTP server for one body: it
//! answers HEAD with the total length and GET with the full body or the
//! requested `bytes=N-` suffix, records every request it sees, and can
//! be made slow (trickling chunks) or broken (fixed error status) to
//! exercise concurrency and failover.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// One request observed by the fake mirror.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

/// Behavior knobs for the fake mirror.
#[derive(Debug, Clone, Copy)]
pub struct MirrorOptions {
    /// Respond to every request with this status line instead of data.
    pub broken_status: Option<&'static str>,
    /// Sleep this long between body chunks.
    pub chunk_delay: Option<Duration>,
    /// Body chunk size when trickling.
    pub chunk_size: usize,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            broken_status: None,
            chunk_delay: None,
            chunk_size: 256,
        }
    }
}

pub struct FakeMirror {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Arc<AtomicBool>,
}

impl FakeMirror {
    pub fn start(body: Vec<u8>) -> Self {
        Self::start_with_options(body, MirrorOptions::default())
    }

    pub fn start_with_options(body: Vec<u8>, options: MirrorOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake mirror");
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let body = Arc::new(body);
        let thread_requests = Arc::clone(&requests);
        let thread_shutdown = Arc::clone(&shutdown);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                if thread_shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let body = Arc::clone(&body);
                let requests = Arc::clone(&thread_requests);
                thread::spawn(move || handle(stream, &body, &requests, options));
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            requests,
            shutdown,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn get_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == "GET")
            .count()
    }
}

impl Drop for FakeMirror {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    requests: &Mutex<Vec<RecordedRequest>>,
    options: MirrorOptions,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buffer = [0u8; 8192];
    let read = match stream.read(&mut buffer) {
        Ok(0) | Err(_) => return,
        Ok(read) => read,
    };
    let Ok(request) = std::str::from_utf8(&buffer[..read]) else {
        return;
    };

    let mut lines = request.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    let mut range = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path,
        range: range.clone(),
    });

    if let Some(status) = options.broken_status {
        let _ = stream.write_all(
            format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        );
        return;
    }

    let total = body.len() as u64;
    if method.eq_ignore_ascii_case("HEAD") {
        let _ = stream.write_all(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\r\n"
            )
            .as_bytes(),
        );
        return;
    }

    let start = range
        .as_deref()
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|spec| spec.strip_suffix('-'))
        .and_then(|start| start.parse::<u64>().ok())
        .unwrap_or(0)
        .min(total);
    let slice = &body[start as usize..];

    let head = if start > 0 {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n\r\n",
            slice.len(),
            start,
            total.saturating_sub(1),
            total
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n\r\n",
            slice.len()
        )
    };
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    match options.chunk_delay {
        Some(delay) => {
            for chunk in slice.chunks(options.chunk_size.max(1)) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// A fully-read response from the proxy.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Issues one request against the proxy and reads the response to EOF
/// (the proxy closes every connection after one exchange).
pub fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, String)],
    body: &[u8],
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).expect("connect to proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() && !headers.iter().any(|(name, _)| *name == "Content-Length") {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).expect("send request");
    stream.write_all(body).expect("send body");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");

    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response has a head");
    let head = std::str::from_utf8(&raw[..split]).expect("head is utf-8");
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status = status_line
        .strip_prefix("HTTP/1.1 ")
        .unwrap_or(status_line)
        .to_string();
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Convenience for plain GETs.
pub fn http_get(addr: SocketAddr, path: &str) -> HttpResponse {
    http_request(addr, "GET", path, &[], b"")
}
