//! 装配协调：完成检测、合并触发与合并结果上报。
//!
//! 完成与否总是从分片目录的实际内容推导，内存中的状态表只用于查询与
//! 日志。任何一次分片通知都可能观察到"已齐全"，但真正执行合并的只有
//! 拿到该装配互斥锁的那个任务；它在锁内重新核对分片数量，因此重复或
//! 过期的触发都会被安全跳过。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk_store::{AssemblyId, ChunkError, ChunkStore};
use crate::config::UploadConfig;
use crate::locking::LockManager;

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// 分片通知后的决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    TriggerMerge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssemblyState {
    Receiving,
    Completing,
    Merged,
    MergeFailed,
}

/// 可轮询的装配状态。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyStatus {
    pub state: AssemblyState,
    pub total: u32,
    pub received: u32,
    pub bytes: Option<u64>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 单次分片接收对调用方的答复。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ChunkReceipt {
    Accepted { index: u32 },
    AssemblyComplete { triggered_merge: bool },
}

/// 一次合并任务的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { bytes: u64 },
    /// 目标文件已存在且未开启覆盖，视为成功，分片保留。
    AlreadyMerged,
    /// 另一个任务正持有该装配的合并锁。
    Busy,
    /// 拿到锁后发现分片已不齐全（例如刚被上一次合并清理）。
    Stale { present: u32 },
    Failed(String),
}

/// 通过广播通道异步上报的合并结果。
#[derive(Clone, Debug)]
pub struct MergeReport {
    pub assembly: AssemblyId,
    pub total: u32,
    pub outcome: MergeOutcome,
}

pub struct AssemblyCoordinator {
    store: Arc<ChunkStore>,
    config: Arc<UploadConfig>,
    merge_locks: LockManager,
    totals: Mutex<HashMap<AssemblyId, u32>>,
    statuses: RwLock<HashMap<AssemblyId, AssemblyStatus>>,
    reports: broadcast::Sender<MergeReport>,
}

impl AssemblyCoordinator {
    pub fn new(store: Arc<ChunkStore>, config: Arc<UploadConfig>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            store,
            config,
            merge_locks: LockManager::new(),
            totals: Mutex::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            reports,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// 订阅合并结果。
    pub fn subscribe(&self) -> broadcast::Receiver<MergeReport> {
        self.reports.subscribe()
    }

    /// 接收一个分片：校验、持久化、通知，必要时在后台启动合并。
    pub async fn accept_chunk(
        self: &Arc<Self>,
        name: &str,
        index: u32,
        total: u32,
        payload: &[u8],
        digest: &str,
    ) -> Result<ChunkReceipt, ChunkError> {
        let id = AssemblyId::parse(name)?;
        self.check_bounds(index, total)?;
        self.check_total(&id, index, total).await?;
        self.store.put(&id, index, payload, digest).await?;
        self.record_total(&id, index, total).await?;
        info!(
            assembly = %id,
            index,
            total,
            bytes = payload.len(),
            "chunk accepted"
        );

        match self.notify_arrived(&id, index, total).await? {
            Action::TriggerMerge => {
                info!(assembly = %id, total, "all chunks received, scheduling merge");
                self.spawn_merge(id, total);
                Ok(ChunkReceipt::AssemblyComplete {
                    triggered_merge: true,
                })
            }
            Action::None => Ok(ChunkReceipt::Accepted { index }),
        }
    }

    /// 根据目录中实际存在的分片数判断是否应触发合并。
    ///
    /// 文件已合并后到达的重复分片直接丢弃，`Merged` 状态保持不变。
    pub async fn notify_arrived(
        &self,
        id: &AssemblyId,
        index: u32,
        total: u32,
    ) -> Result<Action, ChunkError> {
        if self.is_late_chunk(id).await? {
            self.store.remove_chunk(id, index).await?;
            self.totals.lock().await.remove(id);
            info!(assembly = %id, index, "chunk arrived after merge, discarded");
            return Ok(Action::None);
        }

        let observed_at = Utc::now();
        let present = self.store.present_count(id, total).await?;
        let complete = present == total;
        debug!(assembly = %id, index, present, total, "chunk arrival noted");

        let state = if complete {
            AssemblyState::Completing
        } else {
            AssemblyState::Receiving
        };
        self.record_progress(id, total, state, present, observed_at)
            .await;

        Ok(if complete {
            Action::TriggerMerge
        } else {
            Action::None
        })
    }

    /// 由运维显式重新触发合并；分片不齐全时直接拒绝。
    pub async fn trigger_merge(
        self: &Arc<Self>,
        name: &str,
        total: u32,
    ) -> Result<JoinHandle<MergeOutcome>, ChunkError> {
        let id = AssemblyId::parse(name)?;
        self.check_bounds(1, total)?;
        if let Some(&expected) = self.totals.lock().await.get(&id)
            && expected != total
        {
            return Err(ChunkError::TotalMismatch {
                expected,
                got: total,
            });
        }
        let present = self.store.present_count(&id, total).await?;
        if present != total {
            return Err(ChunkError::Incomplete { present, total });
        }
        info!(assembly = %id, total, "merge re-triggered");
        Ok(self.spawn_merge(id, total))
    }

    /// 在独立任务中执行合并，不阻塞分片接收路径。
    pub fn spawn_merge(self: &Arc<Self>, id: AssemblyId, total: u32) -> JoinHandle<MergeOutcome> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_merge(&id, total).await })
    }

    /// 执行合并：每个装配同一时刻至多一个任务越过互斥点。
    pub async fn run_merge(&self, id: &AssemblyId, total: u32) -> MergeOutcome {
        let Some(guard) = self.merge_locks.try_lock(id.as_str()).await else {
            debug!(assembly = %id, "merge already running, skipping trigger");
            return MergeOutcome::Busy;
        };
        let outcome = self.merge_locked(id, total).await;
        self.record_outcome(id, total, &outcome).await;
        drop(guard);
        self.merge_locks.prune(id.as_str()).await;
        outcome
    }

    /// 更新状态表并广播终态结果；跳过的触发不上报。
    async fn record_outcome(&self, id: &AssemblyId, total: u32, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Merged { bytes } => {
                self.totals.lock().await.remove(id);
                self.set_status(id, total, AssemblyState::Merged, total, Some(*bytes), None)
                    .await;
            }
            MergeOutcome::AlreadyMerged => {
                self.totals.lock().await.remove(id);
                self.set_status(id, total, AssemblyState::Merged, total, None, None)
                    .await;
            }
            MergeOutcome::Failed(message) => {
                self.set_status(
                    id,
                    total,
                    AssemblyState::MergeFailed,
                    total,
                    None,
                    Some(message.clone()),
                )
                .await;
            }
            MergeOutcome::Busy | MergeOutcome::Stale { .. } => return,
        }

        // 没有订阅者时发送失败是正常情况
        let _ = self.reports.send(MergeReport {
            assembly: id.clone(),
            total,
            outcome: outcome.clone(),
        });
    }

    async fn merge_locked(&self, id: &AssemblyId, total: u32) -> MergeOutcome {
        let present = match self.store.present_count(id, total).await {
            Ok(present) => present,
            Err(err) => {
                warn!(assembly = %id, error = %err, "merge failed before start");
                return MergeOutcome::Failed(err.to_string());
            }
        };
        if present != total {
            debug!(assembly = %id, present, total, "stale merge trigger");
            return MergeOutcome::Stale { present };
        }

        if !self.config.replace_existing {
            match self.store.merged_exists(id).await {
                Ok(true) => {
                    warn!(
                        assembly = %id,
                        total,
                        "merged file already exists, keeping chunks"
                    );
                    return MergeOutcome::AlreadyMerged;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(assembly = %id, error = %err, "merge failed before start");
                    return MergeOutcome::Failed(err.to_string());
                }
            }
        }

        info!(assembly = %id, total, "merge started");
        let destination = self.store.merged_path(id);
        match self.store.merge_into(id, total, &destination).await {
            Ok(bytes) => {
                let deleted = self.store.delete_all(id, total).await;
                debug!(assembly = %id, total, bytes, deleted, "chunks removed after merge");
                MergeOutcome::Merged { bytes }
            }
            Err(err) => {
                warn!(
                    assembly = %id,
                    total,
                    error = %err,
                    "merge failed, chunks kept for retry"
                );
                MergeOutcome::Failed(err.to_string())
            }
        }
    }

    pub async fn status(&self, name: &str) -> Result<Option<AssemblyStatus>, ChunkError> {
        let id = AssemblyId::parse(name)?;
        Ok(self.statuses.read().await.get(&id).cloned())
    }

    /// 移除超过 `ttl` 未更新的状态及其总数记录，返回移除数量。
    ///
    /// 分片目录仍是权威来源，被移除的装配在下一个分片到达时重新登记。
    pub async fn prune_statuses(&self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        if ttl.is_zero() {
            return 0;
        }
        let cutoff = Utc::now() - ttl;
        let expired: Vec<AssemblyId> = {
            let mut statuses = self.statuses.write().await;
            let expired: Vec<AssemblyId> = statuses
                .iter()
                .filter(|(_, status)| status.updated_at <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                statuses.remove(id);
            }
            expired
        };

        let mut totals = self.totals.lock().await;
        for id in &expired {
            totals.remove(id);
        }
        expired.len()
    }

    fn check_bounds(&self, index: u32, total: u32) -> Result<(), ChunkError> {
        if total == 0 || (self.config.max_chunks > 0 && total > self.config.max_chunks) {
            return Err(ChunkError::InvalidTotal { total });
        }
        if index == 0 || index > total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }
        Ok(())
    }

    /// 写入前核对声明的总数。
    ///
    /// 记录只是缓存：目录中已没有该装配的任何分片时，旧记录视为过期并被丢弃。
    async fn check_total(
        &self,
        id: &AssemblyId,
        index: u32,
        total: u32,
    ) -> Result<(), ChunkError> {
        let Some(expected) = self.totals.lock().await.get(id).copied() else {
            return Ok(());
        };
        if expected == total {
            return Ok(());
        }
        if self.store.has_chunks(id).await? {
            warn!(assembly = %id, index, expected, got = total, "chunk total mismatch");
            return Err(ChunkError::TotalMismatch {
                expected,
                got: total,
            });
        }

        debug!(assembly = %id, expected, total, "dropping stale assembly total");
        let mut totals = self.totals.lock().await;
        if totals.get(id) == Some(&expected) {
            totals.remove(id);
        }
        Ok(())
    }

    /// 分片落盘后记录总数；并发到达的首批分片声明不同总数时后者被拒绝。
    async fn record_total(
        &self,
        id: &AssemblyId,
        index: u32,
        total: u32,
    ) -> Result<(), ChunkError> {
        let mut totals = self.totals.lock().await;
        let expected = *totals.entry(id.clone()).or_insert(total);
        if expected != total {
            warn!(assembly = %id, index, expected, got = total, "chunk total mismatch");
            return Err(ChunkError::TotalMismatch {
                expected,
                got: total,
            });
        }
        Ok(())
    }

    /// 已合并、目标文件仍在且不允许覆盖时，新到的分片只是客户端的迟到重传。
    async fn is_late_chunk(&self, id: &AssemblyId) -> Result<bool, ChunkError> {
        if self.config.replace_existing {
            return Ok(false);
        }
        let merged = matches!(
            self.statuses.read().await.get(id),
            Some(status) if status.state == AssemblyState::Merged
        );
        if !merged {
            return Ok(false);
        }
        self.store.merged_exists(id).await
    }

    /// 记录接收进度，但不覆盖在 `observed_at` 之后才写入的 `Merged`。
    async fn record_progress(
        &self,
        id: &AssemblyId,
        total: u32,
        state: AssemblyState,
        received: u32,
        observed_at: DateTime<Utc>,
    ) {
        let mut statuses = self.statuses.write().await;
        if let Some(current) = statuses.get(id)
            && current.state == AssemblyState::Merged
            && current.updated_at >= observed_at
        {
            debug!(assembly = %id, "merge finished after this count, keeping merged status");
            return;
        }
        statuses.insert(
            id.clone(),
            AssemblyStatus {
                state,
                total,
                received,
                bytes: None,
                error: None,
                updated_at: Utc::now(),
            },
        );
    }

    async fn set_status(
        &self,
        id: &AssemblyId,
        total: u32,
        state: AssemblyState,
        received: u32,
        bytes: Option<u64>,
        error: Option<String>,
    ) {
        self.statuses.write().await.insert(
            id.clone(),
            AssemblyStatus {
                state,
                total,
                received,
                bytes,
                error,
                updated_at: Utc::now(),
            },
        );
    }
}
