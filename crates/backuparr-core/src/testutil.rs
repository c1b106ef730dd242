use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::{BackuparrError, Result};
use crate::storage::{BackupMetadata, StorageBackend};

/// In-memory storage backend for tests. Thread-safe via Mutex.
#[derive(Debug)]
pub struct MemoryBackend {
    display_name: String,
    entries: Mutex<Vec<BackupMetadata>>,
    data: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl MemoryBackend {
    pub fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            entries: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Seed an entry with explicit metadata (e.g. a backdated timestamp).
    pub fn seed(&self, meta: BackupMetadata, data: Vec<u8>) {
        self.data.lock().unwrap().insert(meta.key.clone(), data);
        self.entries.lock().unwrap().push(meta);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.key.clone())
            .collect()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn upload(&self, app_name: &str, file_name: &str, data: &[u8]) -> Result<BackupMetadata> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackuparrError::Backend("simulated upload failure".into()));
        }
        let meta = BackupMetadata {
            key: format!("{app_name}/{file_name}"),
            app_name: app_name.to_string(),
            file_name: file_name.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        self.seed(meta.clone(), data.to_vec());
        Ok(meta)
    }

    fn download(&self, key: &str) -> Result<(Vec<u8>, BackupMetadata)> {
        let entries = self.entries.lock().unwrap();
        let meta = entries
            .iter()
            .find(|m| m.key == key)
            .cloned()
            .ok_or_else(|| BackuparrError::Backend(format!("backup not found: {key}")))?;
        let data = self
            .data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| BackuparrError::Backend(format!("backup not found: {key}")))?;
        Ok((data, meta))
    }

    fn list(&self, app_name: &str) -> Result<Vec<BackupMetadata>> {
        let mut listed: Vec<BackupMetadata> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.app_name == app_name)
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed)
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackuparrError::Backend("simulated delete failure".into()));
        }
        self.entries.lock().unwrap().retain(|m| m.key != key);
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

/// One parsed HTTP request as seen by [`TestServer`].
pub struct TestRequest {
    /// 1-based request counter across the server's lifetime.
    pub hit: usize,
    pub method: String,
    /// Path including any query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CannedResponse {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Minimal canned-response HTTP server on a loopback listener, standing in
/// for the real application APIs in tests. One request per connection; every
/// response carries `Connection: close`.
pub struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn start(
        handler: impl Fn(&TestRequest) -> CannedResponse + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let thread_hits = hits.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let hit = thread_hits.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(request) = read_request(&mut stream, hit) {
                    let response = handler(&request);
                    let _ = write_response(&mut stream, &response);
                }
            }
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Total requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn json(status: u16, body: &str) -> CannedResponse {
        CannedResponse {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn text(status: u16, body: &str) -> CannedResponse {
        CannedResponse {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn status(status: u16, body: &str) -> CannedResponse {
        Self::text(status, body)
    }

    pub fn bytes(status: u16, content_type: &str, body: &[u8]) -> CannedResponse {
        CannedResponse {
            status,
            headers: vec![("Content-Type".into(), content_type.into())],
            body: body.to_vec(),
        }
    }
}

fn read_request(stream: &mut TcpStream, hit: usize) -> Option<TestRequest> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().unwrap_or(0);
            }
            headers.push((name, value));
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).ok()?;
    }

    Some(TestRequest {
        hit,
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &CannedResponse) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    };

    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}
