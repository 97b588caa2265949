use crate::api_client::GiftGateway;
use crate::error::{ServiceError, ServiceResult};
use crate::login::CredentialProvider;
use crate::models::{DispatchConfig, GiftBreakdown, GiftRequest, SelectedCoupon, SharedRecordPatch};
use crate::shared_state::{SharedKey, SharedStateStore};
use crate::utils::now_millis;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 运营本次选中的券，发送后清空
#[derive(Debug, Clone, Default)]
pub struct CouponSelection {
    items: Vec<SelectedCoupon>,
}

impl CouponSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一张券只保留一次，返回是否新增
    pub fn add(&mut self, coupon: SelectedCoupon) -> bool {
        if self.items.iter().any(|item| item.id == coupon.id) {
            return false;
        }
        self.items.push(coupon);
        true
    }

    pub fn remove(&mut self, coupon_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != coupon_id);
        self.items.len() != before
    }

    pub fn items(&self) -> &[SelectedCoupon] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 取走全部并清空
    pub fn take(&mut self) -> Vec<SelectedCoupon> {
        std::mem::take(&mut self.items)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouponOutcome {
    Delivered(GiftBreakdown),
    Failed { message: String },
}

impl CouponOutcome {
    pub fn success_count(&self) -> usize {
        match self {
            Self::Delivered(breakdown) => breakdown.success.len(),
            Self::Failed { .. } => 0,
        }
    }
}

/// 发送进度，UI 按顺序渲染：先占位，完成后替换
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Sending {
        index: usize,
        total: usize,
        coupon: SelectedCoupon,
    },
    Finished {
        index: usize,
        total: usize,
        coupon: SelectedCoupon,
        outcome: CouponOutcome,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub results: Vec<(SelectedCoupon, CouponOutcome)>,
}

impl DispatchSummary {
    pub fn delivered_count(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CouponOutcome::Delivered(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.delivered_count()
    }
}

/// 一张券的结果块
pub fn render_outcome(coupon: &SelectedCoupon, outcome: &CouponOutcome) -> String {
    let title = if coupon.name.is_empty() {
        coupon.keyword.clone()
    } else {
        format!("{}（{}）", coupon.name, coupon.keyword)
    };
    match outcome {
        CouponOutcome::Failed { message } => format!("❌ {title} 发送失败: {message}"),
        CouponOutcome::Delivered(breakdown) => {
            let failed_total: usize = breakdown.failed.values().map(Vec::len).sum();
            let mut lines = vec![format!(
                "✅ {title} 成功 {} 个，失败 {} 个",
                breakdown.success.len(),
                failed_total
            )];
            if !breakdown.success.is_empty() {
                lines.push(format!("  成功: {}", breakdown.success.join(", ")));
            }
            for (reason, ids) in &breakdown.failed {
                lines.push(format!("  {reason}: {}", ids.join(", ")));
            }
            lines.join("\n")
        }
    }
}

/// 逐张调用批量赠券接口，单张失败不影响后续
pub struct DispatchExecutor {
    gateway: Arc<dyn GiftGateway>,
    credentials: Arc<dyn CredentialProvider>,
    config: DispatchConfig,
    /// 上一次请求完成的时间，所有队列共用
    last_request: Mutex<Option<Instant>>,
    bookkeeping: Option<(Arc<dyn SharedStateStore>, String)>,
}

impl DispatchExecutor {
    pub fn new(
        gateway: Arc<dyn GiftGateway>,
        credentials: Arc<dyn CredentialProvider>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            gateway,
            credentials,
            config,
            last_request: Mutex::new(None),
            bookkeeping: None,
        }
    }

    /// 发送成功后累加共享记录的已发放数
    pub fn with_issued_tracking(
        mut self,
        store: Arc<dyn SharedStateStore>,
        provider_id: impl Into<String>,
    ) -> Self {
        self.bookkeeping = Some((store, provider_id.into()));
        self
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.config.send_interval_ms)
    }

    pub async fn send_coupon_queue(
        &self,
        coupons: &[SelectedCoupon],
        content: &str,
        mut on_event: impl FnMut(DispatchEvent),
    ) -> ServiceResult<DispatchSummary> {
        if content.trim().is_empty() {
            return Err(ServiceError::InvalidInput("发送对象不能为空".to_string()));
        }
        let credentials = self
            .credentials
            .scm_credentials()
            .await
            .ok_or(ServiceError::NoLogin)?;

        let total = coupons.len();
        tracing::info!("开始发送 {} 张优惠券", total);
        let mut summary = DispatchSummary::default();
        for (offset, coupon) in coupons.iter().enumerate() {
            let index = offset + 1;
            on_event(DispatchEvent::Sending {
                index,
                total,
                coupon: coupon.clone(),
            });

            let request = GiftRequest {
                action: "giveAll".to_string(),
                credentials: credentials.clone(),
                input_text: content.to_string(),
                coupon_type_id: coupon.id.clone(),
                amount: self.config.amount,
                store_mode: "batch".to_string(),
                interval: self.config.store_interval_ms,
                retry_count: self.config.retry_count,
            };
            let outcome = self.throttled_give(&request).await;
            match &outcome {
                CouponOutcome::Delivered(breakdown) => {
                    tracing::info!(
                        "[{}/{}] {} 发送完成: 成功 {}，失败原因 {}",
                        index,
                        total,
                        coupon.keyword,
                        breakdown.success.len(),
                        breakdown.failed.len()
                    );
                    self.record_issued(coupon, breakdown.success.len()).await;
                }
                CouponOutcome::Failed { message } => {
                    tracing::warn!("[{}/{}] {} 发送失败: {}", index, total, coupon.keyword, message);
                }
            }
            on_event(DispatchEvent::Finished {
                index,
                total,
                coupon: coupon.clone(),
                outcome: outcome.clone(),
            });
            summary.results.push((coupon.clone(), outcome));
        }
        tracing::info!(
            "发送结束: 成功 {} 张，失败 {} 张",
            summary.delivered_count(),
            summary.failed_count()
        );
        Ok(summary)
    }

    /// 与上一次请求完成时间至少间隔 send_interval
    async fn throttled_give(&self, request: &GiftRequest) -> CouponOutcome {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.send_interval();
            if ready_at > Instant::now() {
                tracing::debug!("赠券节流等待 {:?}", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
        let result = self.gateway.give_all(request).await;
        *last = Some(Instant::now());
        drop(last);

        match result {
            Ok(response) if response.success => {
                CouponOutcome::Delivered(response.data.unwrap_or_default())
            }
            Ok(response) => CouponOutcome::Failed {
                message: if response.message.trim().is_empty() {
                    "接口返回失败".to_string()
                } else {
                    response.message
                },
            },
            Err(e) => CouponOutcome::Failed { message: e.toast() },
        }
    }

    async fn record_issued(&self, coupon: &SelectedCoupon, delivered: usize) {
        let Some((store, provider_id)) = &self.bookkeeping else {
            return;
        };
        if delivered == 0 {
            return;
        }
        let key = SharedKey::new(provider_id.clone(), coupon.id.clone());
        // 读后写，多端同时发放时可能少计
        let result: ServiceResult<()> = async {
            let Some(record) = store.get(&key).await? else {
                return Ok(());
            };
            let patch = SharedRecordPatch {
                issued_total: Some(record.issued_total + delivered as i64),
                updated_at: Some(now_millis()),
                ..SharedRecordPatch::default()
            };
            store.update(&key, &patch).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("更新已发放数失败: {} ({})", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon(id: &str) -> SelectedCoupon {
        SelectedCoupon {
            id: id.to_string(),
            keyword: format!("{id}/98折"),
            name: String::new(),
        }
    }

    #[test]
    fn selection_deduplicates_and_takes() {
        let mut selection = CouponSelection::new();
        assert!(selection.add(coupon("1")));
        assert!(!selection.add(coupon("1")));
        assert!(selection.add(coupon("2")));
        assert!(selection.remove("1"));
        assert_eq!(selection.len(), 1);
        let taken = selection.take();
        assert_eq!(taken, vec![coupon("2")]);
        assert!(selection.is_empty());
    }

    #[test]
    fn outcome_renders_failures_by_reason() {
        let mut breakdown = GiftBreakdown {
            success: vec!["S1".to_string(), "S2".to_string()],
            ..GiftBreakdown::default()
        };
        breakdown
            .failed
            .insert("门店不存在".to_string(), vec!["S9".to_string()]);
        let text = render_outcome(&coupon("3000"), &CouponOutcome::Delivered(breakdown));
        assert_eq!(
            text,
            "✅ 3000/98折 成功 2 个，失败 1 个\n  成功: S1, S2\n  门店不存在: S9"
        );

        let text = render_outcome(
            &coupon("3000"),
            &CouponOutcome::Failed {
                message: "超时".to_string(),
            },
        );
        assert_eq!(text, "❌ 3000/98折 发送失败: 超时");
    }
}
