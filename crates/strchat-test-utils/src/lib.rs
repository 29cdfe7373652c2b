use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Canned response served by [`spawn_one_shot_server`].
#[derive(Clone, Debug)]
pub struct CannedResponse {
    pub status_line: String,
    pub content_type: String,
    pub body: String,
}

impl CannedResponse {
    pub fn ok(content_type: &str, body: &str) -> Self {
        Self {
            status_line: "200 OK".to_string(),
            content_type: content_type.to_string(),
            body: body.to_string(),
        }
    }

    pub fn csv(body: &str) -> Self {
        Self::ok("text/csv", body)
    }

    pub fn status(status_line: &str) -> Self {
        Self {
            status_line: status_line.to_string(),
            content_type: "text/plain".to_string(),
            body: String::new(),
        }
    }
}

/// Spawn an HTTP server on loopback that answers exactly one GET with the
/// canned response. Returns the base URL and a receiver yielding the
/// captured request line and headers.
pub fn spawn_one_shot_server(response: CannedResponse) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept mock request");
        let req = read_request_head(&stream);
        let _ = tx.send(req);

        let head = format!(
            "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            response.status_line,
            response.content_type,
            response.body.len(),
        );
        stream
            .write_all(head.as_bytes())
            .and_then(|_| stream.write_all(response.body.as_bytes()))
            .expect("write mock response");
    });

    (format!("http://{addr}"), rx)
}

/// A loopback URL nothing listens on.
pub fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let addr = listener.local_addr().expect("read probe addr");
    drop(listener);
    format!("http://{addr}")
}

fn read_request_head(stream: &TcpStream) -> CapturedRequest {
    let mut reader = BufReader::new(stream.try_clone().expect("clone mock stream"));
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .expect("read request line");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).expect("read header line");
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    CapturedRequest {
        method,
        path,
        headers,
    }
}
