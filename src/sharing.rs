//! 优惠券分享开关：把 Firebase 共享记录和远程领券活动维持在大致一致的状态。
//!
//! 界面状态以活动为准，共享记录只当作"是否共享 + 关键字"的缓存。两边之间没有事务，
//! 任何一步失败都只提示，不回滚已经成功的远程写入。

use crate::api_client::ActivityRegistry;
use crate::error::{ServiceError, ServiceResult};
use crate::login::CredentialProvider;
use crate::models::{
    ActivityForm, Coupon, GrabActivity, NewActivity, ScmCredentials, SharedCouponRecord,
    SharedRecordPatch, SharingConfig,
};
use crate::shared_state::{SharedKey, SharedStateStore};
use crate::utils::{default_window, now_millis};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;

/// 共享是否开启只取决于当前选中的活动
pub fn is_sharing_active(activity: Option<&GrabActivity>) -> bool {
    activity.map(GrabActivity::is_enabled).unwrap_or(false)
}

/// 进程内每张券一把锁，同一进程里的多个弹窗不会同时改同一张券。
/// 跨进程/跨设备仍然是后写覆盖。
#[derive(Default)]
pub struct CouponLocks {
    locks: Mutex<HashMap<SharedKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CouponLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &SharedKey) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(key.clone()).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(key.clone()).or_default().clone(),
        }
    }
}

/// 卡片角标、分享弹窗、聊天列表共用的视图数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharingView {
    pub coupon_id: String,
    pub coupon_name: String,
    pub active: bool,
    /// 共享记录里的 shifenggongxiang
    pub remote_flag: bool,
    pub keyword: String,
    pub activity_id: Option<i64>,
    pub activity_count: usize,
    pub form: ActivityForm,
    pub area_tree_loaded: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    activity_list: Vec<GrabActivity>,
    activity_data: Option<GrabActivity>,
    area_tree: Option<Value>,
    form: ActivityForm,
    record: Option<SharedCouponRecord>,
}

fn render(coupon: &Coupon, state: &SessionState) -> SharingView {
    SharingView {
        coupon_id: coupon.id.clone(),
        coupon_name: coupon.name.clone(),
        active: is_sharing_active(state.activity_data.as_ref()),
        remote_flag: state.record.as_ref().map(|r| r.sharing).unwrap_or(false),
        keyword: state.form.keyword.clone(),
        activity_id: state.activity_data.as_ref().map(|a| a.id),
        activity_count: state.activity_list.len(),
        form: state.form.clone(),
        area_tree_loaded: state.area_tree.is_some(),
    }
}

pub struct SharingController {
    registry: Arc<dyn ActivityRegistry>,
    store: Arc<dyn SharedStateStore>,
    credentials: Arc<dyn CredentialProvider>,
    defaults: SharingConfig,
    locks: Arc<CouponLocks>,
}

impl SharingController {
    pub fn new(
        registry: Arc<dyn ActivityRegistry>,
        store: Arc<dyn SharedStateStore>,
        credentials: Arc<dyn CredentialProvider>,
        defaults: SharingConfig,
    ) -> Self {
        Self {
            registry,
            store,
            credentials,
            defaults,
            locks: Arc::new(CouponLocks::new()),
        }
    }

    /// 打开一张券的分享面板：并行加载共享记录和活动列表，选中第一个活动
    pub async fn open(&self, provider_id: &str, coupon: Coupon) -> ServiceResult<SharingSession> {
        let credentials = self
            .credentials
            .scm_credentials()
            .await
            .ok_or(ServiceError::NoLogin)?;
        let key = SharedKey::new(provider_id, coupon.id.clone());
        let (record, activity_list) = tokio::try_join!(
            self.store.get(&key),
            self.registry.query_activities(&credentials, &coupon.id),
        )?;
        tracing::info!(
            "打开分享面板: {}, 活动 {} 个, 共享记录 {}",
            key,
            activity_list.len(),
            if record.is_some() { "存在" } else { "不存在" }
        );

        let mut state = SessionState {
            activity_list,
            record,
            ..SessionState::default()
        };
        if let Some(first_id) = state.activity_list.first().map(|a| a.id) {
            let (detail, area_tree) = load_detail(&*self.registry, &credentials, first_id).await?;
            state.activity_data = Some(detail);
            state.area_tree = area_tree;
        }
        state.form = seed_form(&coupon, &state, &self.defaults);

        let (view_tx, _) = watch::channel(render(&coupon, &state));
        let session = SharingSession {
            key: key.clone(),
            coupon,
            registry: self.registry.clone(),
            store: self.store.clone(),
            credentials: self.credentials.clone(),
            defaults: self.defaults.clone(),
            lock: self.locks.lock_for(&key),
            state: Arc::new(Mutex::new(state)),
            in_progress: Arc::new(AtomicBool::new(false)),
            view_tx: Arc::new(view_tx),
            listener: None,
        };
        session.start_listener().await
    }
}

async fn load_detail(
    registry: &dyn ActivityRegistry,
    credentials: &ScmCredentials,
    activity_id: i64,
) -> ServiceResult<(GrabActivity, Option<Value>)> {
    let detail = registry.get_activity(credentials, activity_id).await?;
    if !detail.limits_area() {
        return Ok((detail, None));
    }
    // 只有限制区域的活动才需要区域树
    match registry.area_tree(credentials).await {
        Ok(tree) => Ok((detail, Some(tree))),
        Err(e) => {
            tracing::warn!("加载区域树失败: {}", e);
            Ok((detail, None))
        }
    }
}

/// 表单以活动为准；关键字优先取共享记录，其次用券面描述
fn seed_form(coupon: &Coupon, state: &SessionState, defaults: &SharingConfig) -> ActivityForm {
    let keyword = state
        .record
        .as_ref()
        .map(|r| r.keyword.trim().to_string())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| coupon.summary());
    match &state.activity_data {
        Some(activity) => ActivityForm::from_activity(activity, &keyword),
        None => default_form(&keyword, defaults),
    }
}

fn default_form(keyword: &str, defaults: &SharingConfig) -> ActivityForm {
    let (begin, end) = default_window(defaults.duration_days);
    ActivityForm {
        keyword: keyword.to_string(),
        coupon_num: defaults.coupon_num,
        coupon_amount: defaults.coupon_amount,
        begin_time_date: begin,
        end_time_date: end,
        store_subtypes: vec![-1],
        is_limit_area: 0,
    }
}

/// 正在进行的变更操作。存在期间监听回调不刷新界面，drop 时恢复
struct OperationGuard {
    flag: Arc<AtomicBool>,
    _lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// 一个打开的分享面板
pub struct SharingSession {
    key: SharedKey,
    coupon: Coupon,
    registry: Arc<dyn ActivityRegistry>,
    store: Arc<dyn SharedStateStore>,
    credentials: Arc<dyn CredentialProvider>,
    defaults: SharingConfig,
    lock: Arc<tokio::sync::Mutex<()>>,
    state: Arc<Mutex<SessionState>>,
    in_progress: Arc<AtomicBool>,
    view_tx: Arc<watch::Sender<SharingView>>,
    listener: Option<JoinHandle<()>>,
}

impl SharingSession {
    async fn start_listener(mut self) -> ServiceResult<Self> {
        let mut rx = self.store.watch(&self.key).await?;
        let state = self.state.clone();
        let in_progress = self.in_progress.clone();
        let view_tx = self.view_tx.clone();
        let coupon = self.coupon.clone();
        let key = self.key.clone();
        self.listener = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let record = rx.borrow_and_update().clone();
                if in_progress.load(Ordering::SeqCst) {
                    tracing::debug!("操作进行中，跳过共享记录刷新: {}", key);
                    continue;
                }
                let view = match state.lock() {
                    Ok(mut guard) => {
                        guard.record = record;
                        render(&coupon, &guard)
                    }
                    Err(_) => break,
                };
                view_tx.send_replace(view);
            }
            tracing::debug!("共享记录监听退出: {}", key);
        }));
        Ok(self)
    }

    pub fn key(&self) -> &SharedKey {
        &self.key
    }

    pub fn coupon(&self) -> &Coupon {
        &self.coupon
    }

    /// 订阅视图变化，每个界面入口各自订阅
    pub fn subscribe(&self) -> watch::Receiver<SharingView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> ServiceResult<SharingView> {
        Ok(render(&self.coupon, &*self.lock_state()?))
    }

    pub fn is_active(&self) -> ServiceResult<bool> {
        Ok(is_sharing_active(self.lock_state()?.activity_data.as_ref()))
    }

    pub fn activities(&self) -> ServiceResult<Vec<GrabActivity>> {
        Ok(self.lock_state()?.activity_list.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// 停止监听
    pub fn close(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    fn lock_state(&self) -> ServiceResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| ServiceError::Store("分享面板状态锁已损坏".to_string()))
    }

    async fn begin(&self) -> ServiceResult<OperationGuard> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::Busy);
        }
        let mut guard = OperationGuard {
            flag: self.in_progress.clone(),
            _lock: None,
        };
        // 同一张券在其他面板上的操作结束前在这里等待
        guard._lock = Some(self.lock.clone().lock_owned().await);
        Ok(guard)
    }

    async fn require_credentials(&self) -> ServiceResult<ScmCredentials> {
        self.credentials
            .scm_credentials()
            .await
            .ok_or(ServiceError::NoLogin)
    }

    fn publish(&self) -> ServiceResult<SharingView> {
        let view = self.view()?;
        self.view_tx.send_replace(view.clone());
        Ok(view)
    }

    fn finish(&self, action: &str, result: ServiceResult<()>) -> ServiceResult<SharingView> {
        match result {
            Ok(()) => self.publish(),
            Err(e) => {
                tracing::warn!("{} 失败: {} ({})", action, self.key, e.toast());
                // 失败时界面回到已知的本地状态
                let _ = self.publish();
                Err(e)
            }
        }
    }

    /// 开启/关闭共享
    pub async fn toggle(&self) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            let credentials = self.require_credentials().await?;
            let current = self.lock_state()?.activity_data.clone();
            if is_sharing_active(current.as_ref()) {
                self.deactivate(&credentials).await
            } else {
                self.activate(&credentials).await
            }
        }
        .await;
        self.finish("切换共享", result)
    }

    async fn activate(&self, credentials: &ScmCredentials) -> ServiceResult<()> {
        let (current, form) = {
            let state = self.lock_state()?;
            (state.activity_data.clone(), state.form.clone())
        };

        match current {
            Some(activity) => {
                self.registry
                    .set_activity_closed(credentials, activity.id, false)
                    .await?;
                tracing::info!("启用领券活动: {} id={}", self.key, activity.id);
                self.mark_closed(activity.id, false)?;
            }
            None => {
                let request = self.new_activity(&form);
                let created = self.registry.create_activity(credentials, &request).await?;
                let activity_list = self
                    .registry
                    .query_activities(credentials, &self.coupon.id)
                    .await?;
                let selected = created
                    .and_then(|id| activity_list.iter().find(|a| a.id == id))
                    .or_else(|| activity_list.iter().max_by_key(|a| a.id))
                    .cloned()
                    .ok_or_else(|| ServiceError::api("createActivity", "创建后未查到新活动"))?;
                tracing::info!("新建领券活动: {} id={}", self.key, selected.id);
                let mut state = self.lock_state()?;
                state.activity_list = activity_list;
                state.activity_data = Some(selected);
            }
        }

        let patch = SharedRecordPatch {
            sharing: Some(true),
            keyword: Some(form.keyword.clone()),
            name: Some(self.coupon.name.clone()),
            per_store_limit: Some(form.coupon_num),
            total_amount: Some(form.coupon_amount),
            updated_at: Some(now_millis()),
            ..SharedRecordPatch::default()
        };
        self.write_record(&patch).await
    }

    async fn deactivate(&self, credentials: &ScmCredentials) -> ServiceResult<()> {
        let activity = self
            .lock_state()?
            .activity_data
            .clone()
            .ok_or(ServiceError::NoActivity)?;
        self.registry
            .set_activity_closed(credentials, activity.id, true)
            .await?;
        tracing::info!("关闭领券活动: {} id={}", self.key, activity.id);
        self.mark_closed(activity.id, true)?;

        // 重新查询列表；刚关闭的活动以本地结果为准，远端可能还没生效
        let mut activity_list = self
            .registry
            .query_activities(credentials, &self.coupon.id)
            .await?;
        for item in activity_list.iter_mut().filter(|a| a.id == activity.id) {
            item.is_close = 1;
        }
        let others_enabled = activity_list.iter().any(GrabActivity::is_enabled);
        self.lock_state()?.activity_list = activity_list;

        if others_enabled {
            tracing::info!("{} 仍有其他启用中的活动，保留共享标记", self.key);
            return Ok(());
        }
        self.write_record(&SharedRecordPatch {
            sharing: Some(false),
            updated_at: Some(now_millis()),
            ..SharedRecordPatch::default()
        })
        .await
    }

    /// 把表单推到当前活动，只同步关键字到共享记录，不改变开关状态
    pub async fn update(&self, form: ActivityForm) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            if form.keyword.trim().is_empty() {
                return Err(ServiceError::InvalidInput("关键字不能为空".to_string()));
            }
            let credentials = self.require_credentials().await?;
            let mut activity = self
                .lock_state()?
                .activity_data
                .clone()
                .ok_or(ServiceError::NoActivity)?;
            form.apply_to(&mut activity);
            self.registry.edit_activity(&credentials, &activity).await?;
            tracing::info!("更新领券活动: {} id={}", self.key, activity.id);
            {
                let mut state = self.lock_state()?;
                replace_in_list(&mut state.activity_list, &activity);
                state.activity_data = Some(activity);
                state.form = form.clone();
            }
            self.write_record(&SharedRecordPatch {
                keyword: Some(form.keyword.clone()),
                ..SharedRecordPatch::default()
            })
            .await
        }
        .await;
        self.finish("更新活动", result)
    }

    /// 活动参数恢复默认：每店 5 张、总量 10000、今天起 2 天、不限门店和区域
    pub async fn reset(&self) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            let (current, keyword) = {
                let state = self.lock_state()?;
                (state.activity_data.clone(), state.form.keyword.clone())
            };
            let form = default_form(&keyword, &self.defaults);
            if let Some(mut activity) = current {
                let credentials = self.require_credentials().await?;
                form.apply_to(&mut activity);
                self.registry.edit_activity(&credentials, &activity).await?;
                tracing::info!("重置领券活动: {} id={}", self.key, activity.id);
                let mut state = self.lock_state()?;
                replace_in_list(&mut state.activity_list, &activity);
                state.activity_data = Some(activity);
                state.area_tree = None;
            }
            self.lock_state()?.form = form;
            Ok(())
        }
        .await;
        self.finish("重置活动", result)
    }

    /// 删除当前活动；没有启用中的活动时把共享标记置为 false
    pub async fn delete(&self) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            let credentials = self.require_credentials().await?;
            let activity = self
                .lock_state()?
                .activity_data
                .clone()
                .ok_or(ServiceError::NoActivity)?;
            self.registry
                .delete_activity(&credentials, activity.id)
                .await?;
            tracing::info!("删除领券活动: {} id={}", self.key, activity.id);
            {
                let mut state = self.lock_state()?;
                state.activity_data = None;
                state.area_tree = None;
            }
            let activity_list: Vec<GrabActivity> = self
                .registry
                .query_activities(&credentials, &self.coupon.id)
                .await?
                .into_iter()
                .filter(|a| a.id != activity.id)
                .collect();
            let any_enabled = activity_list.iter().any(GrabActivity::is_enabled);
            self.lock_state()?.activity_list = activity_list;
            if any_enabled {
                return Ok(());
            }
            self.write_record(&SharedRecordPatch {
                sharing: Some(false),
                updated_at: Some(now_millis()),
                ..SharedRecordPatch::default()
            })
            .await
        }
        .await;
        self.finish("删除活动", result)
    }

    /// 切换选中的活动
    pub async fn select(&self, activity_id: i64) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            let credentials = self.require_credentials().await?;
            let (detail, area_tree) =
                load_detail(&*self.registry, &credentials, activity_id).await?;
            let mut state = self.lock_state()?;
            state.activity_data = Some(detail);
            state.area_tree = area_tree;
            state.form = seed_form(&self.coupon, &state, &self.defaults);
            Ok(())
        }
        .await;
        self.finish("切换活动", result)
    }

    /// 从远端重新加载活动列表和当前活动
    pub async fn refresh(&self) -> ServiceResult<SharingView> {
        let _guard = self.begin().await?;
        let result = async {
            let credentials = self.require_credentials().await?;
            let (record, activity_list) = tokio::try_join!(
                self.store.get(&self.key),
                self.registry.query_activities(&credentials, &self.coupon.id),
            )?;
            let current_id = self.lock_state()?.activity_data.as_ref().map(|a| a.id);
            let target = current_id
                .filter(|id| activity_list.iter().any(|a| a.id == *id))
                .or_else(|| activity_list.first().map(|a| a.id));
            let loaded = match target {
                Some(id) => Some(load_detail(&*self.registry, &credentials, id).await?),
                None => None,
            };
            let mut state = self.lock_state()?;
            state.activity_list = activity_list;
            state.record = record;
            match loaded {
                Some((detail, area_tree)) => {
                    state.activity_data = Some(detail);
                    state.area_tree = area_tree;
                }
                None => {
                    state.activity_data = None;
                    state.area_tree = None;
                }
            }
            state.form = seed_form(&self.coupon, &state, &self.defaults);
            Ok(())
        }
        .await;
        self.finish("刷新活动", result)
    }

    fn new_activity(&self, form: &ActivityForm) -> NewActivity {
        let store_sub_types = if form.store_subtypes.is_empty() {
            vec![-1]
        } else {
            form.store_subtypes.clone()
        };
        NewActivity {
            event_name: format!("{} 领券", self.coupon.name),
            coupon_type_id: self.coupon.id.clone(),
            coupon_num: form.coupon_num,
            coupon_amount: form.coupon_amount,
            begin_time_date: form.begin_time_date.clone(),
            end_time_date: form.end_time_date.clone(),
            store_sub_types,
            is_limit_area: form.is_limit_area,
        }
    }

    fn mark_closed(&self, activity_id: i64, closed: bool) -> ServiceResult<()> {
        let mut state = self.lock_state()?;
        let flag = i64::from(closed);
        if let Some(activity) = state.activity_data.as_mut().filter(|a| a.id == activity_id) {
            activity.is_close = flag;
        }
        for item in state.activity_list.iter_mut().filter(|a| a.id == activity_id) {
            item.is_close = flag;
        }
        Ok(())
    }

    /// 写共享记录并同步到本地副本
    async fn write_record(&self, patch: &SharedRecordPatch) -> ServiceResult<()> {
        self.store.update(&self.key, patch).await?;
        let mut state = self.lock_state()?;
        let record = state.record.get_or_insert_with(SharedCouponRecord::default);
        patch.apply_to(record);
        Ok(())
    }
}

impl Drop for SharingSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn replace_in_list(list: &mut [GrabActivity], activity: &GrabActivity) {
    for item in list.iter_mut().filter(|a| a.id == activity.id) {
        *item = activity.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(id: i64, is_close: i64) -> GrabActivity {
        GrabActivity {
            id,
            is_close,
            ..GrabActivity::default()
        }
    }

    #[test]
    fn active_only_when_selected_activity_is_open() {
        assert!(!is_sharing_active(None));
        assert!(is_sharing_active(Some(&activity(1, 0))));
        assert!(!is_sharing_active(Some(&activity(1, 1))));
    }

    #[test]
    fn form_prefers_record_keyword_and_activity_values() {
        let coupon = Coupon {
            id: "C1".to_string(),
            name: "满减".to_string(),
            coupon_type: 1,
            min_pay: Some(3000.0),
            discount: Some(98.0),
            price: None,
            begin_time: String::new(),
            end_time: String::new(),
            note: String::new(),
        };
        let mut state = SessionState::default();
        let form = seed_form(&coupon, &state, &SharingConfig::default());
        assert_eq!(form.keyword, "3000/98折");
        assert_eq!(form.coupon_num, 5);
        assert_eq!(form.store_subtypes, vec![-1]);

        state.record = Some(SharedCouponRecord {
            keyword: "三千档".to_string(),
            per_store_limit: 99,
            ..SharedCouponRecord::default()
        });
        state.activity_data = Some(GrabActivity {
            coupon_num: 8,
            ..activity(3, 0)
        });
        let form = seed_form(&coupon, &state, &SharingConfig::default());
        assert_eq!(form.keyword, "三千档");
        // 数量取自活动而不是共享记录
        assert_eq!(form.coupon_num, 8);
    }
}
