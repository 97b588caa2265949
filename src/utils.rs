use chrono::{Duration, Local, NaiveDate};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 从 serde_json::Value（Option 包装）提取 f64，支持 Number 和 String 类型
pub fn to_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(item)) => item.as_f64(),
        Some(Value::String(text)) => text.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

/// 同 [`to_f64`]，取整数
pub fn to_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(item)) => item.as_i64().or_else(|| item.as_f64().map(|v| v as i64)),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        Some(Value::Bool(v)) => Some(i64::from(*v)),
        _ => None,
    }
}

pub fn value_to_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.to_string(),
        Some(Value::Number(num)) => num.to_string(),
        Some(Value::Bool(v)) => v.to_string(),
        _ => String::new(),
    }
}

/// 厂商接口的数字字段时而是数字时而是字符串，统一按宽松规则解析
pub fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(to_i64(raw.as_ref()).unwrap_or_default())
}

pub fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(to_f64(raw.as_ref()))
}

pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(value_to_text(raw.as_ref()))
}

/// 数组字段可能是 null 或夹着字符串数字，无法识别的元素直接丢掉
pub fn lenient_i64_vec<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Array(items)) => items.iter().filter_map(|item| to_i64(Some(item))).collect(),
        _ => Vec::new(),
    })
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// 活动默认时间窗: 今天 .. 今天+days
pub fn default_window(days: i64) -> (String, String) {
    let start = today();
    let end = start + Duration::days(days.max(0));
    (format_day(start), format_day(end))
}

pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub fn now_millis() -> i64 {
    Local::now().timestamp_millis()
}
