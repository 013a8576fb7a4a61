//! 摘要调度 Worker
//!
//! 按 cron 表达式周期性触发到期摘要的发送，收到停止信号后退出。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::digest::DigestService;
use crate::error::{EngineError, Result};

pub struct DigestWorker {
    service: Arc<DigestService>,
    schedule: Schedule,
}

/// Worker 停止句柄
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl DigestWorker {
    /// cron 表达式需要包含秒字段，例如 `0 */5 * * * *`
    pub fn new(service: Arc<DigestService>, cron_expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            EngineError::Internal(format!("无效的摘要 cron 表达式 {cron_expression}: {e}"))
        })?;
        Ok(Self { service, schedule })
    }

    /// 在后台运行，返回停止句柄和任务句柄
    pub fn spawn(self) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        (WorkerHandle { shutdown_tx }, task)
    }

    /// 主循环：等待下一次触发时间，直到收到停止信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(schedule = %self.schedule, "DigestWorker 已启动");

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("cron 表达式没有后续触发时间，DigestWorker 退出");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DigestWorker 已停止");
                        return;
                    }
                }
            }
        }
    }

    /// 执行一轮到期摘要发送
    pub async fn tick(&self) {
        match self.service.process_all_pending_digests().await {
            Ok(report) if report.processed > 0 => {
                info!(
                    processed = report.processed,
                    sent = report.sent,
                    failed = report.failed,
                    "到期摘要处理完成"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "到期摘要处理出错"),
        }
    }
}
