//! SCM/PMS 登录：会话缓存、凭据提供者和登录界面状态机。
//!
//! 界面状态由 [`reduce`] 纯函数推进，渲染层只消费 [`view_model`] 的结果。

use crate::api_client::SessionValidator;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{LoginConfig, ScmCredentials};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// 提供当前 SCM 会话；没有会话时返回 None 并发出"需要登录"信号
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn scm_credentials(&self) -> Option<ScmCredentials>;
}

/// 校验请求本身失败（网络/超时）时怎么处理缓存的会话
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorPolicy {
    AssumeValid,
    AssumeInvalid,
}

/// 校验请求本身失败时保留缓存的会话
pub const ON_VALIDATION_ERROR: ValidationErrorPolicy = ValidationErrorPolicy::AssumeValid;

pub fn resolve_validation(result: ServiceResult<bool>, policy: ValidationErrorPolicy) -> bool {
    match result {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!("会话校验请求失败，按策略 {:?} 处理: {}", policy, e);
            policy == ValidationErrorPolicy::AssumeValid
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionCacheFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub scm: Option<ScmCredentials>,
    #[serde(default)]
    pub pms_ready: bool,
}

/// `scm_session.json` 会话缓存
#[derive(Debug)]
pub struct SessionCache {
    path: PathBuf,
    data: SessionCacheFile,
}

impl SessionCache {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("读取会话缓存失败: {}", path.display()))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("会话缓存格式无效，已忽略: {}", e);
                SessionCacheFile::default()
            })
        } else {
            SessionCacheFile::default()
        };
        Ok(Self { path, data })
    }

    pub fn scm(&self) -> Option<&ScmCredentials> {
        self.data.scm.as_ref()
    }

    pub fn pms_ready(&self) -> bool {
        self.data.pms_ready
    }

    /// 保存新会话；凭据没有过期时间时按 ttl 补上
    pub fn store_scm(&mut self, mut credentials: ScmCredentials, ttl_hours: i64) -> anyhow::Result<()> {
        if credentials.expires_at.is_none() {
            credentials.expires_at = Some(Local::now() + Duration::hours(ttl_hours.max(1)));
        }
        tracing::info!(
            "保存 SCM 会话: provider={}, user={}",
            credentials.provider_id,
            credentials.user_name
        );
        self.data.scm = Some(credentials);
        self.save()
    }

    pub fn mark_pms_ready(&mut self, ready: bool) -> anyhow::Result<()> {
        self.data.pms_ready = ready;
        self.save()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.data.scm = None;
        self.data.pms_ready = false;
        self.save()
    }

    fn save(&mut self) -> anyhow::Result<()> {
        self.data.version = 1;
        self.data.updated_at = Local::now().to_rfc3339();
        write_json_file(&self.path, &self.data)
    }
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(value).with_context(|| "序列化JSON失败")?;
    fs::write(&tmp, content).with_context(|| format!("写入临时文件失败: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("原子替换失败: {}", path.display()))?;
    Ok(())
}

/// 基于会话缓存的凭据提供者
pub struct CachedCredentialProvider {
    cache: Mutex<SessionCache>,
    login_required: Arc<Notify>,
}

impl CachedCredentialProvider {
    pub fn new(cache: SessionCache) -> Self {
        Self {
            cache: Mutex::new(cache),
            login_required: Arc::new(Notify::new()),
        }
    }

    /// 需要登录时被唤醒，登录界面在这里等待
    pub fn login_required(&self) -> Arc<Notify> {
        self.login_required.clone()
    }

    pub async fn store(&self, credentials: ScmCredentials, ttl_hours: i64) -> anyhow::Result<()> {
        self.cache.lock().await.store_scm(credentials, ttl_hours)
    }

    /// 远程校验缓存的会话，明确失效时清掉缓存
    pub async fn validate_cached(
        &self,
        validator: &dyn SessionValidator,
        policy: ValidationErrorPolicy,
    ) -> Option<ScmCredentials> {
        let credentials = self.scm_credentials().await?;
        let valid = resolve_validation(validator.validate(&credentials).await, policy);
        if valid {
            return Some(credentials);
        }
        tracing::warn!("SCM 会话已失效: provider={}", credentials.provider_id);
        if let Err(e) = self.cache.lock().await.clear() {
            tracing::warn!("清理会话缓存失败: {}", e);
        }
        self.login_required.notify_one();
        None
    }
}

#[async_trait]
impl CredentialProvider for CachedCredentialProvider {
    async fn scm_credentials(&self) -> Option<ScmCredentials> {
        let cached = self.cache.lock().await.scm().cloned();
        match cached {
            Some(credentials) if !credentials.is_expired() => Some(credentials),
            Some(_) => {
                tracing::warn!("SCM 会话已过期，需要重新登录");
                self.login_required.notify_one();
                None
            }
            None => {
                tracing::warn!("未找到 SCM 会话，需要登录");
                self.login_required.notify_one();
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Portal {
    Scm,
    Pms,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Checking,
    ScmForm { error: Option<String> },
    ScmQrcode { qr_url: String, polls: u32, scanned: bool },
    PmsQrcode { qr_url: String, polls: u32, scanned: bool },
    Success { user_name: String, pms_ready: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QrPoll {
    Waiting,
    Scanned,
    Expired,
    /// SCM 扫码确认时带回会话，PMS 没有
    Confirmed(Option<ScmCredentials>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginEvent {
    CacheChecked {
        scm: Option<ScmCredentials>,
        pms_ready: bool,
    },
    UseQrcode,
    UseForm,
    ScmLoginFailed(String),
    QrIssued { portal: Portal, qr_url: String },
    QrPolled(QrPoll),
    ScmAuthorized(ScmCredentials),
    PmsAuthorized,
    /// PMS 非必需时可以跳过扫码
    SkipPms,
    Logout,
}

pub fn reduce(state: ViewState, event: LoginEvent) -> ViewState {
    use ViewState::*;
    match (state, event) {
        (_, LoginEvent::Logout) => ScmForm { error: None },
        (Checking, LoginEvent::CacheChecked { scm, pms_ready }) => match scm {
            Some(credentials) if !credentials.is_expired() => after_scm(credentials, pms_ready),
            Some(_) => ScmForm {
                error: Some("登录已过期，请重新登录".to_string()),
            },
            None => ScmForm { error: None },
        },
        (ScmForm { .. }, LoginEvent::UseQrcode) => ScmQrcode {
            qr_url: String::new(),
            polls: 0,
            scanned: false,
        },
        (ScmQrcode { .. }, LoginEvent::UseForm) => ScmForm { error: None },
        (ScmForm { .. }, LoginEvent::ScmLoginFailed(message)) => ScmForm {
            error: Some(message),
        },
        (ScmForm { .. } | ScmQrcode { .. }, LoginEvent::QrIssued { portal: Portal::Scm, qr_url }) => {
            ScmQrcode {
                qr_url,
                polls: 0,
                scanned: false,
            }
        }
        (PmsQrcode { .. }, LoginEvent::QrIssued { portal: Portal::Pms, qr_url }) => PmsQrcode {
            qr_url,
            polls: 0,
            scanned: false,
        },
        (ScmQrcode { qr_url, polls, scanned }, LoginEvent::QrPolled(poll)) => match poll {
            QrPoll::Waiting => ScmQrcode {
                qr_url,
                polls: polls + 1,
                scanned,
            },
            QrPoll::Scanned => ScmQrcode {
                qr_url,
                polls: polls + 1,
                scanned: true,
            },
            QrPoll::Expired => ScmForm {
                error: Some("二维码已过期，请重新获取".to_string()),
            },
            QrPoll::Confirmed(Some(credentials)) => after_scm(credentials, false),
            QrPoll::Confirmed(None) => ScmQrcode {
                qr_url,
                polls: polls + 1,
                scanned,
            },
        },
        (PmsQrcode { qr_url, polls, scanned }, LoginEvent::QrPolled(poll)) => match poll {
            QrPoll::Waiting => PmsQrcode {
                qr_url,
                polls: polls + 1,
                scanned,
            },
            QrPoll::Scanned => PmsQrcode {
                qr_url,
                polls: polls + 1,
                scanned: true,
            },
            QrPoll::Expired => PmsQrcode {
                qr_url: String::new(),
                polls: 0,
                scanned: false,
            },
            QrPoll::Confirmed(_) => Success {
                user_name: String::new(),
                pms_ready: true,
            },
        },
        (ScmForm { .. } | ScmQrcode { .. }, LoginEvent::ScmAuthorized(credentials)) => {
            after_scm(credentials, false)
        }
        (PmsQrcode { .. }, LoginEvent::PmsAuthorized) => Success {
            user_name: String::new(),
            pms_ready: true,
        },
        (PmsQrcode { .. }, LoginEvent::SkipPms) => Success {
            user_name: String::new(),
            pms_ready: false,
        },
        (state, event) => {
            tracing::debug!("登录状态 {:?} 忽略事件 {:?}", state, event);
            state
        }
    }
}

fn after_scm(credentials: ScmCredentials, pms_ready: bool) -> ViewState {
    if pms_ready {
        ViewState::Success {
            user_name: credentials.user_name,
            pms_ready,
        }
    } else {
        ViewState::PmsQrcode {
            qr_url: String::new(),
            polls: 0,
            scanned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewModel {
    pub title: String,
    pub message: String,
    pub show_form: bool,
    pub qr_url: Option<String>,
    pub busy: bool,
}

pub fn view_model(state: &ViewState) -> ViewModel {
    match state {
        ViewState::Checking => ViewModel {
            title: "正在检查登录状态".to_string(),
            message: String::new(),
            show_form: false,
            qr_url: None,
            busy: true,
        },
        ViewState::ScmForm { error } => ViewModel {
            title: "登录 SCM".to_string(),
            message: error.clone().unwrap_or_default(),
            show_form: true,
            qr_url: None,
            busy: false,
        },
        ViewState::ScmQrcode { qr_url, scanned, .. } => qr_view("SCM 扫码登录", qr_url, *scanned),
        ViewState::PmsQrcode { qr_url, scanned, .. } => qr_view("PMS 扫码授权", qr_url, *scanned),
        ViewState::Success { user_name, pms_ready } => ViewModel {
            title: "登录成功".to_string(),
            message: match (user_name.is_empty(), pms_ready) {
                (true, true) => "SCM/PMS 均已登录".to_string(),
                (true, false) => "SCM 已登录，PMS 未授权".to_string(),
                (false, true) => format!("{user_name}，SCM/PMS 均已登录"),
                (false, false) => format!("{user_name}，PMS 未授权"),
            },
            show_form: false,
            qr_url: None,
            busy: false,
        },
    }
}

fn qr_view(title: &str, qr_url: &str, scanned: bool) -> ViewModel {
    ViewModel {
        title: title.to_string(),
        message: if qr_url.is_empty() {
            "正在获取二维码...".to_string()
        } else if scanned {
            "已扫码，请在手机上确认".to_string()
        } else {
            "请使用 App 扫码".to_string()
        },
        show_form: false,
        qr_url: (!qr_url.is_empty()).then(|| qr_url.to_string()),
        busy: qr_url.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QrTicket {
    pub ticket: String,
    pub qr_url: String,
}

#[async_trait]
pub trait QrLoginPortal: Send + Sync {
    fn portal(&self) -> Portal;

    async fn issue(&self) -> ServiceResult<QrTicket>;

    async fn poll(&self, ticket: &QrTicket) -> ServiceResult<QrPoll>;
}

/// 取二维码并轮询到确认、过期或次数用尽，每次状态变化都回调 `on_state`
pub async fn poll_qr_login(
    portal: &dyn QrLoginPortal,
    mut state: ViewState,
    config: &LoginConfig,
    mut on_state: impl FnMut(&ViewState),
) -> ServiceResult<(ViewState, Option<ScmCredentials>)> {
    let ticket = portal.issue().await?;
    state = reduce(
        state,
        LoginEvent::QrIssued {
            portal: portal.portal(),
            qr_url: ticket.qr_url.clone(),
        },
    );
    on_state(&state);

    let interval = std::time::Duration::from_secs(config.qr_poll_interval_secs.max(1));
    for _ in 0..config.qr_max_polls.max(1) {
        tokio::time::sleep(interval).await;
        let poll = portal.poll(&ticket).await?;
        let confirmed = match &poll {
            QrPoll::Confirmed(credentials) => Some(credentials.clone()),
            _ => None,
        };
        let expired = poll == QrPoll::Expired;
        state = reduce(state, LoginEvent::QrPolled(poll));
        on_state(&state);
        if let Some(credentials) = confirmed {
            tracing::info!("{:?} 扫码登录确认", portal.portal());
            return Ok((state, credentials));
        }
        if expired {
            return Ok((state, None));
        }
    }

    tracing::warn!("{:?} 扫码轮询次数用尽", portal.portal());
    Err(ServiceError::InvalidInput("二维码轮询超时".to_string()))
}
