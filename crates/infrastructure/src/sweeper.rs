//! 过期待投递消息的定期清理

use std::sync::Arc;
use std::time::Duration;

use application::{Clock, Outbox};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 启动清理任务：每隔 `interval` 删除一次创建时间早于 `now - retention` 的记录。
/// 启动时立即执行一次，`shutdown` 被取消后退出。
pub fn spawn_expiry_sweeper(
    outbox: Arc<dyn Outbox>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = clock.now() - retention;
                    match outbox.expire_older_than(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "expired pending messages removed"),
                        Err(err) => tracing::error!(error = %err, "failed to expire pending messages"),
                    }
                }
            }
        }
        tracing::debug!("expiry sweeper stopped");
    })
}
