use thiserror::Error;

/// 业务层错误。每个变体都能转换成一条给运营看的提示（toast）。
#[derive(Debug, Error)]
pub enum ServiceError {
    /// 没有可用的 SCM 会话，调用方需要引导登录
    #[error("NO_LOGIN: 未登录或登录已过期")]
    NoLogin,

    /// 接口返回 `success:false`
    #[error("{action} 失败: {message}")]
    Api { action: String, message: String },

    /// 接口返回非 2xx
    #[error("{action} HTTP {status}")]
    HttpStatus { action: String, status: u16 },

    #[error("网络请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("解析响应失败: {0}")]
    Decode(#[from] serde_json::Error),

    /// 共享状态库读写失败
    #[error("共享状态读写失败: {0}")]
    Store(String),

    #[error("当前优惠券没有选中的活动")]
    NoActivity,

    /// 同一张券已有操作在进行中
    #[error("操作进行中，请稍候")]
    Busy,

    #[error("参数无效: {0}")]
    InvalidInput(String),
}

impl ServiceError {
    pub fn api(action: &str, message: impl Into<String>) -> Self {
        Self::Api {
            action: action.to_string(),
            message: message.into(),
        }
    }

    pub fn is_no_login(&self) -> bool {
        matches!(self, Self::NoLogin)
    }

    /// 运营界面上展示的提示文案
    pub fn toast(&self) -> String {
        match self {
            Self::NoLogin => "请先登录 SCM 账号".to_string(),
            Self::Api { message, .. } if !message.trim().is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toast_prefers_remote_message() {
        let err = ServiceError::api("editActivity", "活动已结束");
        assert_eq!(err.toast(), "活动已结束");

        let empty = ServiceError::api("editActivity", "  ");
        assert_eq!(empty.toast(), "editActivity 失败:   ");
    }

    #[test]
    fn no_login_is_tagged() {
        assert!(ServiceError::NoLogin.is_no_login());
        assert!(ServiceError::NoLogin.to_string().starts_with("NO_LOGIN"));
        assert!(!ServiceError::Busy.is_no_login());
    }
}
