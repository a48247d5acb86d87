//! 后台任务：合并结果上报，以及临时文件、废弃分片和状态表的定期清理。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::assembly::{AssemblyCoordinator, MergeOutcome, MergeReport};
use crate::config::{MAINTENANCE_INTERVAL_SECS, UploadConfig};

/// 启动后台任务（合并结果上报与定期清理）。
pub fn spawn_background_tasks(coordinator: Arc<AssemblyCoordinator>, upload: Arc<UploadConfig>) {
    let mut reports = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => log_merge_report(&report),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "merge report sink lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = coordinator
                .store()
                .cleanup_stale_temp_files(upload.temp_ttl)
                .await
            {
                warn!(error = %err, "temp file cleanup failed");
            }
            match coordinator
                .store()
                .cleanup_stale_chunks(upload.temp_ttl)
                .await
            {
                Ok(removed) if removed > 0 => info!(removed, "removed abandoned chunks"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "abandoned chunk cleanup failed"),
            }
            let pruned = coordinator.prune_statuses(upload.temp_ttl).await;
            if pruned > 0 {
                info!(pruned, "pruned idle assembly statuses");
            }
        }
    });
}

fn log_merge_report(report: &MergeReport) {
    match &report.outcome {
        MergeOutcome::Merged { bytes } => {
            info!(
                assembly = %report.assembly,
                total = report.total,
                bytes,
                "file merged"
            );
        }
        MergeOutcome::AlreadyMerged => {
            warn!(
                assembly = %report.assembly,
                total = report.total,
                "merge skipped, file already exists"
            );
        }
        MergeOutcome::Failed(message) => {
            error!(
                assembly = %report.assembly,
                total = report.total,
                error = message.as_str(),
                "merge failed, resend a chunk or request a merge to retry"
            );
        }
        MergeOutcome::Busy | MergeOutcome::Stale { .. } => {}
    }
}
