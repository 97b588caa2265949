//! 聊天窗口里的指令：`@活动` 列出正在共享的券，`送…给…` 按关键字发券。
//! AI 助手通过同样的入口以工具调用的方式触发发券。

use crate::dispatch::{DispatchEvent, DispatchExecutor, render_outcome};
use crate::error::{ServiceError, ServiceResult};
use crate::keyword::KeywordMatcher;
use crate::models::SelectedCoupon;
use crate::shared_state::SharedStateStore;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const LIST_COMMAND: &str = "@活动";
pub const TOOL_SEND_COUPONS: &str = "send_coupons";
pub const TOOL_LIST_SHARED: &str = "list_shared_coupons";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    ListSharing,
    Gift { coupon_text: String, targets: String },
}

impl ChatCommand {
    /// 不是指令时返回 None，交给 AI 对话处理
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.starts_with(LIST_COMMAND) {
            return Some(Self::ListSharing);
        }
        let rest = text
            .strip_prefix('送')
            .or_else(|| text.strip_prefix('发'))?;
        let (coupon_text, targets) = rest.split_once('给')?;
        let coupon_text = coupon_text.trim();
        if coupon_text.is_empty() {
            return None;
        }
        Some(Self::Gift {
            coupon_text: coupon_text.to_string(),
            targets: targets.trim().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SendCouponsArgs {
    coupons: String,
    targets: String,
}

/// OpenAI 兼容的 function 定义，DeepSeek/GLM 通用
pub fn tool_definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": TOOL_SEND_COUPONS,
                "description": "按关键字把正在共享的优惠券发给门店或手机号",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "coupons": {"type": "string", "description": "优惠券描述，如 3000/98折"},
                        "targets": {"type": "string", "description": "门店ID或手机号，多个用空格分隔"}
                    },
                    "required": ["coupons", "targets"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": TOOL_LIST_SHARED,
                "description": "列出当前正在共享的优惠券及关键字",
                "parameters": {"type": "object", "properties": {}}
            }
        }
    ])
}

pub struct CommandRouter {
    store: Arc<dyn SharedStateStore>,
    provider_id: String,
    matcher: KeywordMatcher,
    dispatcher: Arc<DispatchExecutor>,
}

impl CommandRouter {
    pub fn new(
        store: Arc<dyn SharedStateStore>,
        provider_id: impl Into<String>,
        dispatcher: Arc<DispatchExecutor>,
    ) -> Self {
        Self {
            store,
            provider_id: provider_id.into(),
            matcher: KeywordMatcher::default(),
            dispatcher,
        }
    }

    /// 当前正在共享、且配置了关键字的券
    pub async fn shared_coupons(&self) -> ServiceResult<Vec<SelectedCoupon>> {
        let records = self.store.list(&self.provider_id).await?;
        Ok(records
            .into_iter()
            .filter(|(_, record)| record.sharing && !record.keyword.trim().is_empty())
            .map(|(coupon_id, record)| SelectedCoupon {
                id: coupon_id,
                keyword: record.keyword,
                name: record.name,
            })
            .collect())
    }

    pub async fn list_sharing(&self) -> ServiceResult<String> {
        let records = self.store.list(&self.provider_id).await?;
        let lines: Vec<String> = records
            .values()
            .filter(|record| record.sharing)
            .enumerate()
            .map(|(idx, record)| {
                format!(
                    "{}. {} {} 单店限领{} 已发放{}",
                    idx + 1,
                    record.keyword,
                    record.name,
                    record.per_store_limit,
                    record.issued_total
                )
            })
            .collect();
        if lines.is_empty() {
            return Ok("当前没有正在共享的优惠券".to_string());
        }
        Ok(format!("正在共享的优惠券:\n{}", lines.join("\n")))
    }

    /// 匹配关键字后依次发送，返回整段结果文本
    pub async fn gift(
        &self,
        coupon_text: &str,
        targets: &str,
        on_event: impl FnMut(DispatchEvent),
    ) -> ServiceResult<String> {
        if targets.trim().is_empty() {
            return Err(ServiceError::InvalidInput("请说明要发给哪些门店".to_string()));
        }
        let candidates = self.shared_coupons().await?;
        let report = self.matcher.match_keywords(coupon_text, &candidates);
        if report.matched.is_empty() {
            return Ok(report.hint().unwrap_or_else(|| {
                format!("没有识别到优惠券描述: {}", coupon_text.trim())
            }));
        }

        let summary = self
            .dispatcher
            .send_coupon_queue(&report.matched, targets, on_event)
            .await?;
        let mut blocks: Vec<String> = summary
            .results
            .iter()
            .map(|(coupon, outcome)| render_outcome(coupon, outcome))
            .collect();
        if let Some(hint) = report.hint() {
            blocks.insert(0, hint);
        }
        Ok(blocks.join("\n"))
    }

    /// 处理一条聊天消息；不是指令返回 None
    pub async fn handle(
        &self,
        text: &str,
        on_event: impl FnMut(DispatchEvent),
    ) -> ServiceResult<Option<String>> {
        match ChatCommand::parse(text) {
            Some(ChatCommand::ListSharing) => self.list_sharing().await.map(Some),
            Some(ChatCommand::Gift {
                coupon_text,
                targets,
            }) => self.gift(&coupon_text, &targets, on_event).await.map(Some),
            None => Ok(None),
        }
    }

    /// 执行 AI 返回的工具调用，结果文本作为 tool 消息回传给模型
    pub async fn handle_tool_call(
        &self,
        name: &str,
        arguments: &str,
        on_event: impl FnMut(DispatchEvent),
    ) -> ServiceResult<String> {
        tracing::info!("AI 工具调用: {} {}", name, arguments);
        match name {
            TOOL_SEND_COUPONS => {
                let args: SendCouponsArgs = serde_json::from_str(arguments)?;
                self.gift(&args.coupons, &args.targets, on_event).await
            }
            TOOL_LIST_SHARED => self.list_sharing().await,
            other => Err(ServiceError::InvalidInput(format!("未知工具: {other}"))),
        }
    }
}
