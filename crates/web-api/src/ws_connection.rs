use std::sync::Arc;
use std::time::Duration;

use application::{AckProcessor, Clock, HubHandle, OutboundPayload, Teardown};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use config::SessionConfig;
use domain::{DeviceId, Frame, UserId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// WebSocket 连接
///
/// 一个连接对应一个会话和两个泵：
/// - 读泵：解析客户端帧，转给协调器或确认处理器；只有 pong 会刷新读期限
/// - 写泵：把出站队列写到套接字，合并积压帧，定期发送 ping
///
/// 任一泵退出都会触发同一个 [`Teardown`]，另一个泵随之结束。
pub struct WebSocketConnection {
    socket: WebSocket,
    hub: HubHandle,
    inbound: Inbound,
    config: SessionConfig,
}

impl WebSocketConnection {
    pub fn new(
        socket: WebSocket,
        state: crate::AppState,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Self {
        Self {
            socket,
            hub: state.hub.clone(),
            inbound: Inbound {
                user_id,
                device_id,
                hub: state.hub,
                acks: state.acks,
                clock: state.clock,
            },
            config: state.session,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            hub,
            inbound,
            config,
        } = self;

        let (session, queue) = hub.open_session(inbound.user_id.clone(), inbound.device_id.clone());
        let teardown = Teardown::new(hub.clone(), &session);
        if let Err(err) = hub.register(session).await {
            tracing::error!(error = %err, user_id = %inbound.user_id, "failed to register session");
            return;
        }
        teardown.activate();

        let user_id = inbound.user_id.clone();
        let device_id = inbound.device_id.clone();
        tracing::info!(user_id = %user_id, device_id = %device_id, "WebSocket 连接已建立");

        let (sink, stream) = socket.split();
        let read_task = tokio::spawn(inbound.pump(stream, config.read_timeout(), teardown.clone()));
        let write_task = tokio::spawn(outbound_pump(sink, queue, config, teardown.clone()));

        let (read, write) = tokio::join!(read_task, write_task);
        if let Err(err) = read.and(write) {
            tracing::error!(error = %err, "connection pump panicked");
            teardown.fire("pump panicked").await;
        }
        teardown.finish();

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            state = ?teardown.state(),
            "WebSocket 连接已断开"
        );
    }
}

/// 读泵的上下文
struct Inbound {
    user_id: UserId,
    device_id: DeviceId,
    hub: HubHandle,
    acks: Arc<AckProcessor>,
    clock: Arc<dyn Clock>,
}

impl Inbound {
    async fn pump(
        self,
        mut stream: SplitStream<WebSocket>,
        read_timeout: Duration,
        teardown: Teardown,
    ) {
        let mut deadline = Instant::now() + read_timeout;

        let reason = loop {
            let next = tokio::select! {
                _ = teardown.cancelled() => break "session closed",
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let message = match next {
                Err(_) => break "read deadline exceeded",
                Ok(None) => break "connection closed",
                Ok(Some(Err(err))) => {
                    tracing::debug!(error = %err, user_id = %self.user_id, "websocket read failed");
                    break "read failed";
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                WsMessage::Text(text) => self.handle_text(text.as_str()).await,
                WsMessage::Pong(_) => deadline = Instant::now() + read_timeout,
                WsMessage::Close(_) => break "client closed",
                WsMessage::Binary(_) | WsMessage::Ping(_) => {}
            }
        };

        teardown.fire(reason).await;
    }

    async fn handle_text(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, user_id = %self.user_id, "malformed frame dropped");
                return;
            }
        };

        match frame {
            Frame::Message(mut message) => {
                if message.from != self.user_id {
                    tracing::warn!(
                        user_id = %self.user_id,
                        claimed = %message.from,
                        "message sender does not match session, dropped"
                    );
                    return;
                }
                if message.timestamp == 0 {
                    message.timestamp = self.clock.unix_now();
                }
                if let Err(err) = self.hub.dispatch(message).await {
                    tracing::warn!(error = %err, "failed to submit message");
                }
            }
            Frame::Ack(ack) => {
                if ack.to != self.user_id {
                    tracing::warn!(
                        user_id = %self.user_id,
                        claimed = %ack.to,
                        "ack recipient does not match session, dropped"
                    );
                    return;
                }
                self.acks.process(ack).await;
            }
            Frame::Unknown => {
                tracing::debug!(user_id = %self.user_id, "unknown frame type ignored");
            }
        }
    }
}

async fn outbound_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut queue: mpsc::Receiver<OutboundPayload>,
    config: SessionConfig,
    teardown: Teardown,
) {
    let write_timeout = config.write_timeout();
    let ping_interval = config.ping_interval();
    // 固定节奏发送 ping，不随数据写入顺延：读期限只由 pong 刷新
    let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    let reason = loop {
        tokio::select! {
            _ = teardown.cancelled() => {
                let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
                break "session closed";
            }
            next = queue.recv() => {
                let Some(first) = next else {
                    let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
                    break "outbound queue closed";
                };
                let frame = coalesce(first, &mut queue);
                match tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(frame.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(error = %err, "websocket write failed");
                        break "write failed";
                    }
                    Err(_) => break "write deadline exceeded",
                }
            }
            _ = keepalive.tick() => {
                match tokio::time::timeout(write_timeout, sink.send(WsMessage::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(error = %err, "websocket ping failed");
                        break "ping failed";
                    }
                    Err(_) => break "ping deadline exceeded",
                }
            }
        }
    };

    teardown.fire(reason).await;
}

/// 把队列中已有的帧合并进同一个文本帧，以换行分隔
fn coalesce(first: OutboundPayload, queue: &mut mpsc::Receiver<OutboundPayload>) -> String {
    let mut frame = String::from(&*first);
    for _ in 0..queue.len() {
        match queue.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_queued_frames_with_newlines() {
        let (tx, mut rx) = mpsc::channel::<OutboundPayload>(8);
        tx.try_send(Arc::from("{\"n\":2}")).unwrap();
        tx.try_send(Arc::from("{\"n\":3}")).unwrap();

        let frame = coalesce(Arc::from("{\"n\":1}"), &mut rx);
        assert_eq!(frame, "{\"n\":1}\n{\"n\":2}\n{\"n\":3}");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_frame_is_sent_as_is() {
        let (_tx, mut rx) = mpsc::channel::<OutboundPayload>(8);
        assert_eq!(coalesce(Arc::from("{}"), &mut rx), "{}");
    }
}
