use crate::utils::{lenient_f64, lenient_i64, lenient_i64_vec, lenient_string};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_proxy_url() -> String {
    "https://api.lezhiquan.com/yhq/proxy".to_string()
}

fn default_gift_url() -> String {
    "https://api.lezhiquan.com/yhq/give".to_string()
}

fn default_api_timeout() -> u64 {
    15
}

fn default_page_size() -> u32 {
    20
}

fn default_send_interval_ms() -> u64 {
    2500
}

fn default_store_interval_ms() -> u64 {
    1000
}

fn default_retry_count() -> u32 {
    3
}

fn default_gift_amount() -> u32 {
    1
}

fn default_coupon_num() -> i64 {
    5
}

fn default_coupon_amount() -> i64 {
    10000
}

fn default_duration_days() -> i64 {
    2
}

fn default_stale_days() -> i64 {
    60
}

fn default_session_ttl_hours() -> i64 {
    12
}

fn default_qr_poll_interval_secs() -> u64 {
    2
}

fn default_qr_max_polls() -> u32 {
    60
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_file() -> String {
    "lezhiquan.log".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "default_gift_url")]
    pub gift_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            gift_url: default_gift_url(),
            timeout: default_api_timeout(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirebaseConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_store_interval_ms")]
    pub store_interval_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_gift_amount")]
    pub amount: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval_ms(),
            store_interval_ms: default_store_interval_ms(),
            retry_count: default_retry_count(),
            amount: default_gift_amount(),
        }
    }
}

/// 新建/重置活动时使用的默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingConfig {
    #[serde(default = "default_coupon_num")]
    pub coupon_num: i64,
    #[serde(default = "default_coupon_amount")]
    pub coupon_amount: i64,
    #[serde(default = "default_duration_days")]
    pub duration_days: i64,
    #[serde(default = "default_stale_days")]
    pub stale_days: i64,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            coupon_num: default_coupon_num(),
            coupon_amount: default_coupon_amount(),
            duration_days: default_duration_days(),
            stale_days: default_stale_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    #[serde(default = "default_qr_poll_interval_secs")]
    pub qr_poll_interval_secs: u64,
    #[serde(default = "default_qr_max_polls")]
    pub qr_max_polls: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
            qr_poll_interval_secs: default_qr_poll_interval_secs(),
            qr_max_polls: default_qr_max_polls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub firebase: FirebaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sharing: SharingConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SCM 会话凭据，由登录模块写入缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScmCredentials {
    pub provider_id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Local>>,
}

impl ScmCredentials {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| deadline <= Local::now())
            .unwrap_or(false)
    }
}

/// 厂商后台的优惠券，只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_i64")]
    pub coupon_type: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub min_pay: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub discount: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub begin_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub end_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub note: String,
}

impl Coupon {
    /// 卡片上显示的简短描述，如 "2000/98折" 或 "3000-100"
    pub fn summary(&self) -> String {
        let threshold = self.min_pay.unwrap_or_default();
        match (self.discount, self.price) {
            (Some(discount), _) if discount > 0.0 => {
                format!("{}/{}折", format_number(threshold), format_number(discount))
            }
            (_, Some(price)) => format!("{}-{}", format_number(threshold), format_number(price)),
            _ => self.name.clone(),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Firebase `yhq_gx/{providerId}/{couponId}` 下的共享记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharedCouponRecord {
    #[serde(rename = "shifenggongxiang", default)]
    pub sharing: bool,
    #[serde(rename = "guanjianzi", default)]
    pub keyword: String,
    #[serde(rename = "mingcheng", default)]
    pub name: String,
    #[serde(rename = "dandianxianzhi", default)]
    pub per_store_limit: i64,
    #[serde(rename = "zengsongzongshu", default)]
    pub total_amount: i64,
    #[serde(rename = "yifafangzongshu", default)]
    pub issued_total: i64,
    #[serde(rename = "gengxinshijian", default)]
    pub updated_at: i64,
}

/// 共享记录的局部更新，只序列化被设置的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharedRecordPatch {
    #[serde(rename = "shifenggongxiang", skip_serializing_if = "Option::is_none")]
    pub sharing: Option<bool>,
    #[serde(rename = "guanjianzi", skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(rename = "mingcheng", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "dandianxianzhi", skip_serializing_if = "Option::is_none")]
    pub per_store_limit: Option<i64>,
    #[serde(rename = "zengsongzongshu", skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<i64>,
    #[serde(rename = "yifafangzongshu", skip_serializing_if = "Option::is_none")]
    pub issued_total: Option<i64>,
    #[serde(rename = "gengxinshijian", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl SharedRecordPatch {
    pub fn apply_to(&self, record: &mut SharedCouponRecord) {
        if let Some(v) = self.sharing {
            record.sharing = v;
        }
        if let Some(v) = &self.keyword {
            record.keyword = v.clone();
        }
        if let Some(v) = &self.name {
            record.name = v.clone();
        }
        if let Some(v) = self.per_store_limit {
            record.per_store_limit = v;
        }
        if let Some(v) = self.total_amount {
            record.total_amount = v;
        }
        if let Some(v) = self.issued_total {
            record.issued_total = v;
        }
        if let Some(v) = self.updated_at {
            record.updated_at = v;
        }
    }
}

/// 领券活动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GrabActivity {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub event_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub coupon_type_id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub coupon_num: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub coupon_amount: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub begin_time_date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub end_time_date: String,
    #[serde(default, deserialize_with = "lenient_i64_vec")]
    pub store_subtypes: Vec<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub is_limit_area: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub is_close: i64,
}

impl GrabActivity {
    pub fn is_enabled(&self) -> bool {
        self.is_close == 0
    }

    pub fn limits_area(&self) -> bool {
        self.is_limit_area == 1
    }
}

/// 新建活动请求体
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivity {
    pub event_name: String,
    pub coupon_type_id: String,
    pub coupon_num: i64,
    pub coupon_amount: i64,
    pub begin_time_date: String,
    pub end_time_date: String,
    #[serde(rename = "storeSubTypes")]
    pub store_sub_types: Vec<i64>,
    pub is_limit_area: i64,
}

/// 分享弹窗里可编辑的表单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActivityForm {
    pub keyword: String,
    pub coupon_num: i64,
    pub coupon_amount: i64,
    pub begin_time_date: String,
    pub end_time_date: String,
    pub store_subtypes: Vec<i64>,
    pub is_limit_area: i64,
}

impl ActivityForm {
    pub fn from_activity(activity: &GrabActivity, keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            coupon_num: activity.coupon_num,
            coupon_amount: activity.coupon_amount,
            begin_time_date: activity.begin_time_date.clone(),
            end_time_date: activity.end_time_date.clone(),
            store_subtypes: activity.store_subtypes.clone(),
            is_limit_area: activity.is_limit_area,
        }
    }

    /// 把表单值写回活动，不改变 isClose
    pub fn apply_to(&self, activity: &mut GrabActivity) {
        activity.coupon_num = self.coupon_num;
        activity.coupon_amount = self.coupon_amount;
        activity.begin_time_date = self.begin_time_date.clone();
        activity.end_time_date = self.end_time_date.clone();
        activity.store_subtypes = self.store_subtypes.clone();
        activity.is_limit_area = self.is_limit_area;
    }
}

/// 选中的待发放优惠券
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedCoupon {
    pub id: String,
    pub keyword: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftRequest {
    pub action: String,
    pub credentials: ScmCredentials,
    pub input_text: String,
    pub coupon_type_id: String,
    pub amount: u32,
    pub store_mode: String,
    pub interval: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GiftBreakdown {
    #[serde(default)]
    pub success: Vec<String>,
    /// 失败原因 -> 门店/手机号列表
    #[serde(default)]
    pub failed: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct GiftResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<GiftBreakdown>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
}
