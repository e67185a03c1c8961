#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{AckProcessor, Hub, HubHandle, MemoryOutbox, SystemClock};
use config::{HubConfig, JwtConfig, SessionConfig};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, Claims, JwtService};

pub const SECRET: &str = "integration-test-secret-with-more-than-32-chars";

pub struct TestServer {
    pub addr: SocketAddr,
    pub outbox: Arc<MemoryOutbox>,
    pub hub: HubHandle,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(SessionConfig::default()).await
}

/// 使用指定的会话时限启动服务
pub async fn spawn_server_with(session: SessionConfig) -> TestServer {
    let outbox = Arc::new(MemoryOutbox::new(
        Arc::new(SystemClock),
        Duration::from_secs(7 * 24 * 3600),
    ));
    let hub_config = HubConfig::default();
    let (hub, _task) = Hub::spawn(outbox.clone(), &hub_config);
    let acks = Arc::new(AckProcessor::new(
        outbox.clone(),
        hub.clone(),
        hub_config.outbox_write_timeout(),
    ));
    let jwt_service = Arc::new(JwtService::new(&JwtConfig {
        secret: SECRET.to_string(),
    }));
    let state = AppState::new(
        hub.clone(),
        acks,
        jwt_service,
        session,
        Arc::new(SystemClock),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.ok();
    });

    TestServer { addr, outbox, hub }
}

pub fn token(user_id: &str) -> String {
    let claims = Claims {
        user_id: user_id.to_string(),
        exp: (get_current_timestamp() + 3600) as i64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("encode token")
}

impl TestServer {
    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/api/v1/ws?{}", self.addr, query)
    }

    /// 以查询参数携带令牌连接，并等到会话在协调器中登记完成
    pub async fn connect(&self, user_id: &str, device_id: &str) -> TestClient {
        let before = self.session_count(user_id).await;
        let url = self.ws_url(&format!("deviceId={}&token={}", device_id, token(user_id)));
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        self.wait_for_sessions_above(user_id, before).await;
        TestClient {
            ws,
            pending: VecDeque::new(),
        }
    }

    pub async fn session_count(&self, user_id: &str) -> usize {
        self.hub
            .lookup_sessions(user_id.into())
            .await
            .expect("hub running")
            .len()
    }

    async fn wait_for_sessions_above(&self, user_id: &str, before: usize) {
        for _ in 0..100 {
            if self.session_count(user_id).await > before {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        // 同一设备重连时数量不变，交给调用方自行确认
    }

    pub async fn wait_for_pending(&self, expected: usize) {
        for _ in 0..100 {
            if self.outbox.len().await == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {} pending messages, found {}",
            expected,
            self.outbox.len().await
        );
    }
}

/// 一段时间内从服务端收到的内容
#[derive(Debug, Default)]
pub struct Observed {
    pub pings: usize,
    pub frames: Vec<Value>,
}

pub struct TestClient {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Value>,
}

impl TestClient {
    pub async fn send_json(&mut self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws
            .send(TungsteniteMessage::Text(text.into()))
            .await
            .expect("send frame");
    }

    /// 读取下一帧 JSON；服务端合并发送的多条以换行拆开
    pub async fn next_json(&mut self) -> Value {
        self.try_next_json(Duration::from_secs(3))
            .await
            .expect("frame arrives in time")
    }

    pub async fn try_next_json(&mut self, wait: Duration) -> Option<Value> {
        if let Some(value) = self.pending.pop_front() {
            return Some(value);
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let message = timeout(deadline - tokio::time::Instant::now(), self.ws.next())
                .await
                .ok()??
                .ok()?;
            match message {
                TungsteniteMessage::Text(text) => {
                    for line in text.as_str().split('\n').filter(|l| !l.is_empty()) {
                        self.pending
                            .push_back(serde_json::from_str(line).expect("valid json frame"));
                    }
                    if let Some(value) = self.pending.pop_front() {
                        return Some(value);
                    }
                }
                TungsteniteMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// 持续读取 `wait` 时长。读取过程中客户端会自动回应 ping
    pub async fn read_for(&mut self, wait: Duration) -> Observed {
        let deadline = tokio::time::Instant::now() + wait;
        let mut observed = Observed::default();
        observed.frames.extend(self.pending.drain(..));
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => break,
                Ok(Some(Ok(TungsteniteMessage::Ping(_)))) => observed.pings += 1,
                Ok(Some(Ok(TungsteniteMessage::Text(text)))) => {
                    for line in text.as_str().split('\n').filter(|l| !l.is_empty()) {
                        observed
                            .frames
                            .push(serde_json::from_str(line).expect("valid json frame"));
                    }
                }
                Ok(Some(Ok(TungsteniteMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                    panic!("connection closed while reading")
                }
                Ok(Some(Ok(_))) => {}
            }
        }
        observed
    }

    /// 等待服务端关闭连接
    pub async fn expect_closed(&mut self) {
        let closed = timeout(Duration::from_secs(3), async {
            loop {
                match self.ws.next().await {
                    Some(Ok(TungsteniteMessage::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed by server");
    }
}
