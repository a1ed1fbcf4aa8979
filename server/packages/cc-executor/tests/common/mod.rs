#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cc_executor::{AppState, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(AppState::new(config).expect("valid config"));
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                cc_executor::serve(listener, state, async move {
                    let _ = signal.await;
                })
                .await
                .expect("server");
            })
        };
        Self {
            addr,
            state,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws/mcp", self.addr)
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::open(&self.url()).await
    }

    pub async fn resume(&self, session_id: &str, token: &str) -> TestClient {
        TestClient::open(&self.resume_url(session_id, token)).await
    }

    pub fn resume_url(&self, session_id: &str, token: &str) -> String {
        format!(
            "{}?session_id={}&reconnect_token={}",
            self.url(),
            session_id,
            token
        )
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(15), &mut self.task).await;
    }
}

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestClient {
    pub ws: Socket,
    pub greeting: Value,
    pub session_id: String,
    pub reconnect_token: String,
    /// Answer `ping` notifications with `pong`.
    pub auto_pong: bool,
    backlog: VecDeque<Value>,
    next_id: i64,
}

impl TestClient {
    pub async fn open(url: &str) -> Self {
        let mut ws = raw_connect(url).await;
        let greeting = read_json(&mut ws).await.expect("greeting");
        assert_eq!(greeting["method"], "connected", "unexpected greeting {greeting}");
        let params = &greeting["params"];
        Self {
            session_id: params["session_id"].as_str().expect("session id").to_string(),
            reconnect_token: params["reconnect_token"]
                .as_str()
                .expect("token")
                .to_string(),
            greeting,
            ws,
            auto_pong: true,
            backlog: VecDeque::new(),
            next_id: 0,
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("send");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send");
    }

    pub async fn request(&mut self, method: &str, params: Value) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await;
        id
    }

    /// Next message that is not a `ping`.
    pub async fn next_message(&mut self) -> Value {
        if let Some(message) = self.backlog.pop_front() {
            return message;
        }
        loop {
            let message = read_json(&mut self.ws).await.expect("connection closed");
            if message["method"] == "ping" {
                if self.auto_pong {
                    self.send_json(json!({ "jsonrpc": "2.0", "method": "pong" }))
                        .await;
                }
                continue;
            }
            return message;
        }
    }

    /// Waits for the response to `id`, keeping any notification seen on the
    /// way for [`Self::next_message`].
    pub async fn response(&mut self, id: i64) -> Value {
        let mut skipped = VecDeque::new();
        let response = loop {
            let message = self.next_message().await;
            if message.get("method").is_none() && message["id"] == id {
                break message;
            }
            skipped.push_back(message);
        };
        skipped.extend(self.backlog.drain(..));
        self.backlog = skipped;
        response
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.request(method, params).await;
        self.response(id).await
    }

    pub async fn execute(&mut self, command: &str) -> Value {
        self.call("execute", json!({ "command": command })).await
    }

    pub async fn control(&mut self, kind: &str) -> Value {
        self.call("control", json!({ "type": kind })).await
    }

    /// Every message up to and including `process.completed`.
    pub async fn until_completed(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        loop {
            let message = self.next_message().await;
            let done = message["method"] == "process.completed";
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    pub async fn wait_for(&mut self, method: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message["method"] == method {
                return message;
            }
        }
    }

    /// Reads until the server closes the socket and returns the close code.
    pub async fn expect_close(&mut self) -> Option<u16> {
        expect_close(&mut self.ws).await
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub async fn raw_connect(url: &str) -> Socket {
    let (ws, _) = tokio::time::timeout(RECV_TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect");
    ws
}

/// Next text frame as JSON, or `None` once the server closed the socket.
pub async fn read_json(ws: &mut Socket) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message");
        match frame {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(&text).expect("server sent invalid json"))
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

pub async fn expect_close(ws: &mut Socket) -> Option<u16> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Close(frame))) => return frame.map(|frame| u16::from(frame.code)),
            Some(Ok(_)) => continue,
            None | Some(Err(_)) => return None,
        }
    }
}

pub fn output_of(messages: &[Value], stream: &str) -> String {
    messages
        .iter()
        .filter(|message| message["method"] == "process.output")
        .filter(|message| message["params"]["type"] == stream)
        .map(|message| message["params"]["data"].as_str().unwrap_or_default())
        .collect()
}

/// True while a process with this pid exists (zombies included).
pub fn process_exists(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Polls until `pid` is gone or only a zombie awaiting its reaper remains.
pub async fn wait_until_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_exists(pid) || is_zombie(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z')
}
