//! Small fakes shared by the unit tests.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use wiremock::matchers::{any, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Local HTTP service answering each request with its path echoed in a
/// JSON body. Paths starting with `/slow` are answered after `slow_delay`.
pub async fn spawn_echo_service(slow_delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    let echo = |req: &wiremock::Request| {
        ResponseTemplate::new(200).set_body_raw(
            format!(r#"{{"path":"{}"}}"#, req.url.path()),
            "application/json",
        )
    };

    Mock::given(path_regex("^/slow"))
        .respond_with(move |req: &wiremock::Request| echo(req).set_delay(slow_delay))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(any()).respond_with(echo).mount(&server).await;

    server
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Broker end of a session channel
pub struct BrokerSide {
    pub authorization: Option<String>,
    pub path: String,
    ws: WebSocketStream<TcpStream>,
}

impl BrokerSide {
    pub async fn send(&mut self, value: serde_json::Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Next text frame, or `None` once the client closes the channel
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next data frame payload, parsed
    pub async fn next_payload(&mut self) -> Option<serde_json::Value> {
        let text = self.next_text().await?;
        let mut frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "data");
        Some(frame["payload"].take())
    }
}

/// Accept a single channel handshake; returns the channel base URL
pub async fn spawn_broker(reject_status: Option<u16>) -> (Url, JoinHandle<BrokerSide>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/ws/tunnel/t1", listener.local_addr().unwrap())).unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let seen = Arc::new(Mutex::new((None, String::new())));
        let seen_cb = seen.clone();

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let authorization = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            *seen_cb.lock().unwrap() = (authorization, req.uri().path().to_string());
            match reject_status {
                Some(status) => Err(http::Response::builder()
                    .status(status)
                    .body(None)
                    .unwrap()),
                None => Ok(resp),
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            // Rejected on purpose; keep the task parked
            Err(_) => std::future::pending().await,
        };

        let (authorization, path) = seen.lock().unwrap().clone();
        BrokerSide {
            authorization,
            path,
            ws,
        }
    });

    (url, handle)
}

/// Broker that completes every channel handshake and then drops the
/// socket. The counter tracks accepted handshakes.
pub async fn spawn_flapping_broker() -> (Url, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/ws/tunnel/t1", listener.local_addr().unwrap())).unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(ws);
            }
        }
    });

    (url, accepted)
}

/// Local TCP service whose accepted sockets are handed to the test
pub async fn spawn_tcp_service() -> (u16, tokio::sync::mpsc::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).await.is_err() {
                break;
            }
        }
    });

    (port, rx)
}
