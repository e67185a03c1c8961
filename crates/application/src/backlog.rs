use std::sync::Arc;
use std::time::Duration;

use domain::Frame;

use crate::outbox::Outbox;
use crate::session::{OutboundPayload, SessionHandle};

/// 把发件箱中积压的消息重放给刚登记的会话，返回入队条数。
///
/// 只发给这一个会话，且不删除记录：记录要等客户端确认后才删除，
/// 因此确认之前上线的每个设备都会收到一份。
pub async fn replay(outbox: Arc<dyn Outbox>, session: SessionHandle, timeout: Duration) -> usize {
    let pending = match tokio::time::timeout(timeout, outbox.list_pending_for(session.user_id())).await
    {
        Ok(Ok(pending)) => pending,
        Ok(Err(err)) => {
            tracing::error!(error = %err, user_id = %session.user_id(), "failed to load pending messages");
            return 0;
        }
        Err(_) => {
            tracing::error!(user_id = %session.user_id(), "loading pending messages timed out");
            return 0;
        }
    };

    let mut replayed = 0;
    for record in &pending {
        let payload = match Frame::Message(record.to_message()).to_json() {
            Ok(json) => OutboundPayload::from(json),
            Err(err) => {
                tracing::error!(error = %err, id = %record.id, "failed to serialize pending message");
                continue;
            }
        };
        if !session.enqueue(payload).await {
            tracing::debug!(user_id = %session.user_id(), "session closed during backlog replay");
            break;
        }
        replayed += 1;
    }

    if replayed > 0 {
        tracing::info!(
            user_id = %session.user_id(),
            device_id = %session.device_id(),
            replayed,
            "backlog replayed"
        );
    }
    replayed
}
