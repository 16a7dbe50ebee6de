//! The production transport against a local HTTP responder.

use edge_dispatch::{
    DispatchError, EdgeRequest, HttpTransport, ReqwestTransport, SenderConfig,
    HEADER_VALIDATION_TOKEN,
};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

fn request(url: Url) -> EdgeRequest {
    EdgeRequest {
        url,
        headers: vec![
            ("accept".to_string(), "application/json".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            (HEADER_VALIDATION_TOKEN.to_string(), "token-1".to_string()),
        ],
        body: json!({ "events": [] }),
        request_id: "req-1".to_string(),
        request_event_ids: vec!["e1".to_string()],
    }
}

/// Read one HTTP/1.1 request (headers plus `Content-Length` body).
async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&raw).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if raw.len() >= end + 4 + content_length {
                return text;
            }
        }
    }
    String::from_utf8_lossy(&raw).to_string()
}

/// Serve a single canned response and hand back the request text.
async fn serve_once(response: &'static str) -> (Url, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let text = read_request(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        let _ = tx.send(text);
    });

    let url = Url::parse(&format!("http://{}/ee/v1/interact?configId=cfg", addr)).unwrap();
    (url, rx)
}

#[tokio::test]
async fn posts_headers_and_body() {
    let (url, seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"requestId\":\"r\"}",
    )
    .await;

    let transport = ReqwestTransport::new(&SenderConfig::default()).unwrap();
    let response = transport.post(&request(url)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "{\"requestId\":\"r\"}");
    assert!(response.retry_after.is_none());

    let text = seen.await.unwrap();
    assert!(text.starts_with("POST /ee/v1/interact?configId=cfg HTTP/1.1"));
    let lower = text.to_ascii_lowercase();
    assert!(lower.contains("x-adobe-aep-validation-token: token-1"));
    assert!(lower.contains("content-type: application/json"));
    assert!(text.ends_with("{\"events\":[]}"));
}

#[tokio::test]
async fn surfaces_retry_after() {
    let (url, _seen) = serve_once(
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;

    let transport = ReqwestTransport::new(&SenderConfig::default()).unwrap();
    let response = transport.post(&request(url)).await.unwrap();
    assert_eq!(response.status, 429);
    assert_eq!(response.retry_after.as_deref(), Some("7"));
}

#[tokio::test]
async fn connection_refused_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = ReqwestTransport::new(&SenderConfig {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap();
    let url = Url::parse(&format!("http://{}/ee/v1/interact", addr)).unwrap();
    assert!(matches!(
        transport.post(&request(url)).await,
        Err(DispatchError::TransientNetwork(_))
    ));
}

#[tokio::test]
async fn read_timeout_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let transport = ReqwestTransport::new(&SenderConfig {
        connect_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();
    let url = Url::parse(&format!("http://{}/ee/v1/interact", addr)).unwrap();
    assert!(matches!(
        transport.post(&request(url)).await,
        Err(DispatchError::TransientNetwork(_))
    ));
}
