use crate::error::{ServiceError, ServiceResult};
use crate::login::CredentialProvider;
use crate::models::{
    ApiConfig, Coupon, GiftRequest, GiftResponse, GrabActivity, NewActivity, ScmCredentials,
};
use crate::utils::to_i64;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// 厂商优惠券列表
#[async_trait]
pub trait CouponSource: Send + Sync {
    async fn list_coupons(
        &self,
        credentials: &ScmCredentials,
        keyword: &str,
        page_size: u32,
    ) -> ServiceResult<Vec<Coupon>>;
}

/// 领券活动的远程增删改查
#[async_trait]
pub trait ActivityRegistry: Send + Sync {
    async fn query_activities(
        &self,
        credentials: &ScmCredentials,
        coupon_id: &str,
    ) -> ServiceResult<Vec<GrabActivity>>;

    async fn get_activity(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<GrabActivity>;

    /// 返回新活动 id（接口没有返回时为 None）
    async fn create_activity(
        &self,
        credentials: &ScmCredentials,
        activity: &NewActivity,
    ) -> ServiceResult<Option<i64>>;

    async fn edit_activity(
        &self,
        credentials: &ScmCredentials,
        activity: &GrabActivity,
    ) -> ServiceResult<()>;

    /// disableActivity 接口，isClose=1 关闭、isClose=0 启用
    async fn set_activity_closed(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
        closed: bool,
    ) -> ServiceResult<()>;

    async fn delete_activity(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<()>;

    async fn area_tree(&self, credentials: &ScmCredentials) -> ServiceResult<Value>;
}

/// 批量赠券云函数
#[async_trait]
pub trait GiftGateway: Send + Sync {
    async fn give_all(&self, request: &GiftRequest) -> ServiceResult<GiftResponse>;
}

/// 校验缓存的会话是否仍然有效
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, credentials: &ScmCredentials) -> ServiceResult<bool>;
}

/// 代理接口客户端：所有调用都是 POST `{credentials, action, ...params}`
#[derive(Clone)]
pub struct ProxyClient {
    proxy_url: String,
    gift_url: String,
    client: reqwest::Client,
}

impl ProxyClient {
    pub fn new(config: &ApiConfig) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout.max(1)))
            .default_headers(default_headers())
            .build()?;
        Ok(Self {
            proxy_url: config.proxy_url.trim_end_matches('/').to_string(),
            gift_url: config.gift_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// 调用代理接口，返回 `data` 字段
    async fn call(
        &self,
        credentials: &ScmCredentials,
        action: &str,
        params: Value,
    ) -> ServiceResult<Value> {
        let body = build_body(credentials, action, params)?;
        tracing::debug!("代理接口请求: action={}", action);
        let response = self.client.post(&self.proxy_url).json(&body).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ServiceError::HttpStatus {
                action: action.to_string(),
                status,
            });
        }
        let envelope: Value = response.json().await?;
        unwrap_envelope(action, envelope)
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

fn build_body(credentials: &ScmCredentials, action: &str, params: Value) -> ServiceResult<Value> {
    let mut body = Map::new();
    body.insert("credentials".to_string(), serde_json::to_value(credentials)?);
    body.insert("action".to_string(), Value::String(action.to_string()));
    match params {
        Value::Object(extra) => body.extend(extra),
        Value::Null => {}
        other => {
            return Err(ServiceError::InvalidInput(format!(
                "{action} 参数必须是对象: {other}"
            )));
        }
    }
    Ok(Value::Object(body))
}

/// 解析 `{success, data|message}` 信封
fn unwrap_envelope(action: &str, envelope: Value) -> ServiceResult<Value> {
    let success = envelope
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !success {
        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("未知错误")
            .to_string();
        tracing::warn!("代理接口返回失败: action={}, message={}", action, message);
        return Err(ServiceError::api(action, message));
    }
    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
}

/// 列表接口有时直接返回数组，有时包在 list/records/rows 里
fn extract_list(data: Value) -> Value {
    if data.is_array() {
        return data;
    }
    for key in ["list", "records", "rows", "data"] {
        if let Some(inner) = data.get(key) {
            if inner.is_array() {
                return inner.clone();
            }
        }
    }
    Value::Array(Vec::new())
}

#[async_trait]
impl CouponSource for ProxyClient {
    async fn list_coupons(
        &self,
        credentials: &ScmCredentials,
        keyword: &str,
        page_size: u32,
    ) -> ServiceResult<Vec<Coupon>> {
        let data = self
            .call(
                credentials,
                "list",
                json!({"keyword": keyword, "pageNo": 1, "pageSize": page_size.max(1)}),
            )
            .await?;
        Ok(serde_json::from_value(extract_list(data))?)
    }
}

#[async_trait]
impl ActivityRegistry for ProxyClient {
    async fn query_activities(
        &self,
        credentials: &ScmCredentials,
        coupon_id: &str,
    ) -> ServiceResult<Vec<GrabActivity>> {
        let data = self
            .call(
                credentials,
                "queryActivity",
                json!({"couponTypeId": coupon_id}),
            )
            .await?;
        let activities: Vec<GrabActivity> = serde_json::from_value(extract_list(data))?;
        // 接口按券过滤不可靠，本地再过滤一次
        Ok(activities
            .into_iter()
            .filter(|item| item.coupon_type_id.is_empty() || item.coupon_type_id == coupon_id)
            .collect())
    }

    async fn get_activity(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<GrabActivity> {
        let data = self
            .call(credentials, "getActivity", json!({"id": activity_id}))
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn create_activity(
        &self,
        credentials: &ScmCredentials,
        activity: &NewActivity,
    ) -> ServiceResult<Option<i64>> {
        let data = self
            .call(credentials, "createActivity", serde_json::to_value(activity)?)
            .await?;
        let id = to_i64(Some(&data)).or_else(|| to_i64(data.get("id")));
        tracing::info!("创建领券活动成功: coupon={}, id={:?}", activity.coupon_type_id, id);
        Ok(id)
    }

    async fn edit_activity(
        &self,
        credentials: &ScmCredentials,
        activity: &GrabActivity,
    ) -> ServiceResult<()> {
        self.call(credentials, "editActivity", serde_json::to_value(activity)?)
            .await?;
        Ok(())
    }

    async fn set_activity_closed(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
        closed: bool,
    ) -> ServiceResult<()> {
        self.call(
            credentials,
            "disableActivity",
            json!({"id": activity_id, "isClose": i64::from(closed)}),
        )
        .await?;
        Ok(())
    }

    async fn delete_activity(
        &self,
        credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<()> {
        self.call(credentials, "deleteActivity", json!({"id": activity_id}))
            .await?;
        Ok(())
    }

    async fn area_tree(&self, credentials: &ScmCredentials) -> ServiceResult<Value> {
        self.call(credentials, "getAreaTree", Value::Null).await
    }
}

#[async_trait]
impl GiftGateway for ProxyClient {
    async fn give_all(&self, request: &GiftRequest) -> ServiceResult<GiftResponse> {
        let response = self.client.post(&self.gift_url).json(request).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ServiceError::HttpStatus {
                action: request.action.clone(),
                status,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SessionValidator for ProxyClient {
    /// 用最轻的鉴权调用探测会话；接口以登录类原因拒绝时视为失效，其他错误原样上抛
    async fn validate(&self, credentials: &ScmCredentials) -> ServiceResult<bool> {
        match self.list_coupons(credentials, "", 1).await {
            Ok(_) => Ok(true),
            Err(ServiceError::Api { message, .. }) if is_auth_failure(&message) => Ok(false),
            Err(ServiceError::HttpStatus { status: 401, .. })
            | Err(ServiceError::HttpStatus { status: 403, .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }
}

/// 接口拒绝的原因里出现这些词时才认定会话失效
const AUTH_FAILURE_HINTS: [&str; 7] = ["登录", "会话", "过期", "失效", "未授权", "session", "token"];

fn is_auth_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    AUTH_FAILURE_HINTS.iter().any(|hint| message.contains(hint))
}

/// 优惠券搜索。没有凭据时返回 `NoLogin`，由调用方负责弹登录
pub struct CouponDirectory {
    source: Arc<dyn CouponSource>,
    credentials: Arc<dyn CredentialProvider>,
    page_size: u32,
}

impl CouponDirectory {
    pub fn new(
        source: Arc<dyn CouponSource>,
        credentials: Arc<dyn CredentialProvider>,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            credentials,
            page_size,
        }
    }

    pub async fn search(&self, keyword: &str) -> ServiceResult<Vec<Coupon>> {
        let credentials = self
            .credentials
            .scm_credentials()
            .await
            .ok_or(ServiceError::NoLogin)?;
        let coupons = self
            .source
            .list_coupons(&credentials, keyword.trim(), self.page_size)
            .await?;
        tracing::info!("搜索优惠券: keyword={}, 命中 {} 张", keyword.trim(), coupons.len());
        Ok(coupons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ScmCredentials {
        ScmCredentials {
            provider_id: "P1".to_string(),
            session_id: "S1".to_string(),
            user_name: String::new(),
            expires_at: None,
        }
    }

    #[test]
    fn body_merges_params() {
        let body = build_body(&credentials(), "getActivity", json!({"id": 3})).unwrap();
        assert_eq!(body["action"], "getActivity");
        assert_eq!(body["id"], 3);
        assert_eq!(body["credentials"]["providerId"], "P1");
        assert!(build_body(&credentials(), "x", json!([1])).is_err());
    }

    #[test]
    fn envelope_failure_carries_message() {
        let err = unwrap_envelope("list", json!({"success": false, "message": "会话失效"}))
            .unwrap_err();
        assert_eq!(err.toast(), "会话失效");
        let data = unwrap_envelope("list", json!({"success": true, "data": [1]})).unwrap();
        assert_eq!(data, json!([1]));
    }

    #[test]
    fn only_auth_messages_invalidate_session() {
        assert!(is_auth_failure("登录已过期，请重新扫码"));
        assert!(is_auth_failure("Invalid Session"));
        assert!(!is_auth_failure("系统繁忙，请稍后再试"));
        assert!(!is_auth_failure(""));
    }

    #[test]
    fn list_extraction_accepts_wrappers() {
        assert_eq!(extract_list(json!({"records": [1, 2]})), json!([1, 2]));
        assert_eq!(extract_list(json!([3])), json!([3]));
        assert_eq!(extract_list(json!({"total": 0})), json!([]));
    }
}
