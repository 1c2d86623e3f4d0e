//! Helpers shared by the unit tests.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::backend::MemoryBackend;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::events::RecordingSink;

/// Answer exactly one HTTP request with `status` and `body`; the handle
/// resolves to the raw request text.
pub async fn serve_once(
    status: u16,
    body: &'static str,
) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&buf).to_string()
    });
    (format!("http://{addr}"), handle)
}

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub backend: Arc<MemoryBackend>,
    pub events: Arc<RecordingSink>,
}

/// Context wired to an in-memory backend and a recording event sink.
pub fn harness() -> Harness {
    harness_with(AppConfig::with_backend("http://127.0.0.1:9", "anon"))
}

pub fn harness_with(config: AppConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let events = Arc::new(RecordingSink::new());
    let ctx = Arc::new(AppContext::new(
        config,
        backend.clone(),
        events.clone(),
        None,
    ));
    Harness {
        ctx,
        backend,
        events,
    }
}
