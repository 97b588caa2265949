use crate::error::ServiceResult;
use crate::models::SharedCouponRecord;
use crate::shared_state::{SharedKey, SharedStateStore};
use chrono::Duration;

/// 超过 stale_days 没有更新的记录视为过期
pub fn is_stale(record: &SharedCouponRecord, now_millis: i64, stale_days: i64) -> bool {
    let cutoff = now_millis - Duration::days(stale_days.max(1)).num_milliseconds();
    record.updated_at < cutoff
}

/// 删除某个供应商下的过期共享记录，返回删除条数。
/// 单条删除失败只记日志，继续处理其余记录。
pub async fn sweep_stale_records(
    store: &dyn SharedStateStore,
    provider_id: &str,
    now_millis: i64,
    stale_days: i64,
) -> ServiceResult<usize> {
    let records = store.list(provider_id).await?;
    let mut removed = 0usize;
    for (coupon_id, record) in &records {
        if !is_stale(record, now_millis, stale_days) {
            continue;
        }
        let key = SharedKey::new(provider_id, coupon_id.clone());
        match store.remove(&key).await {
            Ok(()) => {
                removed += 1;
                tracing::info!("清理过期共享记录: {} ({})", key, record.keyword);
            }
            Err(e) => tracing::warn!("清理共享记录失败: {} ({})", key, e),
        }
    }
    tracing::info!(
        "过期共享记录清理完成: provider={}, 检查 {} 条, 删除 {} 条",
        provider_id,
        records.len(),
        removed
    );
    Ok(removed)
}
