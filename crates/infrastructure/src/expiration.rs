use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use scheduler_core::clock::Clock;
use scheduler_core::config::ExpirationConfig;
use scheduler_domain::entities::DocumentType;
use scheduler_domain::repositories::DocumentQuery;
use scheduler_domain::scripts::DeleteDocumentsArgs;
use scheduler_errors::SchedulerResult;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::script_invoker::ScriptInvoker;

/// 带过期时间的分区; 锁租约过期后由接管逻辑处理, 这里同样清理
const EXPIRING_PARTITIONS: [DocumentType; 7] = [
    DocumentType::Job,
    DocumentType::State,
    DocumentType::Set,
    DocumentType::Hash,
    DocumentType::List,
    DocumentType::Counter,
    DocumentType::Lock,
];

/// 一次清理的统计
#[derive(Debug, Default, Clone)]
pub struct ExpirationStats {
    pub removed: Vec<(DocumentType, u64)>,
    pub total_removed: u64,
    pub duration: std::time::Duration,
}

/// 过期数据清理服务
///
/// 周期性删除 `expire_on` 已到的文档, 防止存储无限增长。
pub struct ExpirationManager {
    invoker: ScriptInvoker,
    clock: Arc<dyn Clock>,
    config: ExpirationConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ExpirationManager {
    pub fn new(invoker: ScriptInvoker, clock: Arc<dyn Clock>, config: ExpirationConfig) -> Self {
        Self {
            invoker,
            clock,
            config,
            shutdown_tx: None,
            sweep_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweep_handle.is_some()
    }

    /// 启动后台清理
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if !self.config.enabled {
            info!("Expiration manager is disabled");
            return Ok(());
        }
        if self.is_running() {
            warn!("Expiration manager already running");
            return Ok(());
        }

        info!(
            check_interval_seconds = self.config.check_interval_seconds,
            "Starting expiration manager"
        );

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let invoker = self.invoker.clone();
        let clock = self.clock.clone();
        let check_interval = self.config.check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(check_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::sweep(&invoker, clock.as_ref()).await {
                            error!(error = %e, "Expiration sweep failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Expiration manager shutdown requested");
                        break;
                    }
                }
            }
        });

        self.sweep_handle = Some(handle);
        Ok(())
    }

    /// 停止后台清理并等待任务结束
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.sweep_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Error waiting for expiration manager to stop");
            }
        }
        info!("Expiration manager stopped");
        Ok(())
    }

    /// 立即执行一次清理
    pub async fn sweep_once(&self) -> SchedulerResult<ExpirationStats> {
        Self::sweep(&self.invoker, self.clock.as_ref()).await
    }

    async fn sweep(invoker: &ScriptInvoker, clock: &dyn Clock) -> SchedulerResult<ExpirationStats> {
        let start = Instant::now();
        let now = clock.now_epoch();
        let mut stats = ExpirationStats::default();

        for doc_type in EXPIRING_PARTITIONS {
            let outcome = invoker
                .invoke(DeleteDocumentsArgs {
                    query: DocumentQuery::of(doc_type).expiring_at_or_before(now),
                })
                .await?;
            if outcome.affected > 0 {
                counter!("expired_documents_removed_total", "partition" => doc_type.as_str())
                    .increment(outcome.affected);
                debug!(partition = %doc_type, removed = outcome.affected, "expired documents removed");
            }
            stats.removed.push((doc_type, outcome.affected));
            stats.total_removed += outcome.affected;
        }

        stats.duration = start.elapsed();
        info!(
            total_removed = stats.total_removed,
            duration_ms = stats.duration.as_millis() as u64,
            "Expiration sweep completed"
        );
        Ok(stats)
    }
}

impl Drop for ExpirationManager {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
