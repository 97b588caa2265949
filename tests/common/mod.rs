#![allow(dead_code)]

use async_trait::async_trait;
use lezhiquan::api_client::{ActivityRegistry, GiftGateway};
use lezhiquan::login::CredentialProvider;
use lezhiquan::models::{
    Coupon, GiftBreakdown, GiftRequest, GiftResponse, GrabActivity, NewActivity, ScmCredentials,
};
use lezhiquan::{ServiceError, ServiceResult};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::time::Instant;

pub fn credentials() -> ScmCredentials {
    ScmCredentials {
        provider_id: "P100".to_string(),
        session_id: "sess-1".to_string(),
        user_name: "测试".to_string(),
        expires_at: None,
    }
}

pub fn coupon(id: &str) -> Coupon {
    Coupon {
        id: id.to_string(),
        name: "满3000打98折".to_string(),
        coupon_type: 1,
        min_pay: Some(3000.0),
        discount: Some(98.0),
        price: None,
        begin_time: "2026-10-01".to_string(),
        end_time: "2026-12-31".to_string(),
        note: String::new(),
    }
}

pub struct StaticCredentials(pub Option<ScmCredentials>);

impl StaticCredentials {
    pub fn logged_in() -> Self {
        Self(Some(credentials()))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn scm_credentials(&self) -> Option<ScmCredentials> {
        self.0.clone()
    }
}

/// 内存版活动后台，记录调用
#[derive(Default)]
pub struct FakeRegistry {
    pub activities: Mutex<BTreeMap<i64, GrabActivity>>,
    pub created: Mutex<Vec<NewActivity>>,
    pub calls: Mutex<Vec<String>>,
    /// 开关/新建活动前的延迟，用来制造并发窗口
    pub delay: std::time::Duration,
    next_id: Mutex<i64>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(100),
            ..Self::default()
        }
    }

    pub fn with_activities(items: Vec<GrabActivity>) -> Self {
        let registry = Self::new();
        {
            let mut activities = registry.activities.lock().unwrap();
            for item in items {
                activities.insert(item.id, item);
            }
        }
        registry
    }

    pub fn slow(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    pub fn activity(&self, id: i64) -> Option<GrabActivity> {
        self.activities.lock().unwrap().get(&id).cloned()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

pub fn activity(id: i64, coupon_id: &str, is_close: i64) -> GrabActivity {
    GrabActivity {
        id,
        event_name: format!("活动{id}"),
        coupon_type_id: coupon_id.to_string(),
        coupon_num: 8,
        coupon_amount: 500,
        begin_time_date: "2026-10-01".to_string(),
        end_time_date: "2026-10-31".to_string(),
        store_subtypes: vec![3, 4],
        is_limit_area: 0,
        is_close,
    }
}

#[async_trait]
impl ActivityRegistry for FakeRegistry {
    async fn query_activities(
        &self,
        _credentials: &ScmCredentials,
        coupon_id: &str,
    ) -> ServiceResult<Vec<GrabActivity>> {
        self.record("queryActivity");
        Ok(self
            .activities
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.coupon_type_id == coupon_id)
            .cloned()
            .collect())
    }

    async fn get_activity(
        &self,
        _credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<GrabActivity> {
        self.record("getActivity");
        self.activity(activity_id)
            .ok_or_else(|| ServiceError::api("getActivity", "活动不存在"))
    }

    async fn create_activity(
        &self,
        _credentials: &ScmCredentials,
        activity: &NewActivity,
    ) -> ServiceResult<Option<i64>> {
        self.record("createActivity");
        self.pause().await;
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.created.lock().unwrap().push(activity.clone());
        self.activities.lock().unwrap().insert(
            id,
            GrabActivity {
                id,
                event_name: activity.event_name.clone(),
                coupon_type_id: activity.coupon_type_id.clone(),
                coupon_num: activity.coupon_num,
                coupon_amount: activity.coupon_amount,
                begin_time_date: activity.begin_time_date.clone(),
                end_time_date: activity.end_time_date.clone(),
                store_subtypes: activity.store_sub_types.clone(),
                is_limit_area: activity.is_limit_area,
                is_close: 0,
            },
        );
        Ok(Some(id))
    }

    async fn edit_activity(
        &self,
        _credentials: &ScmCredentials,
        activity: &GrabActivity,
    ) -> ServiceResult<()> {
        self.record("editActivity");
        self.activities
            .lock()
            .unwrap()
            .insert(activity.id, activity.clone());
        Ok(())
    }

    async fn set_activity_closed(
        &self,
        _credentials: &ScmCredentials,
        activity_id: i64,
        closed: bool,
    ) -> ServiceResult<()> {
        self.record("disableActivity");
        self.pause().await;
        match self.activities.lock().unwrap().get_mut(&activity_id) {
            Some(item) => {
                item.is_close = i64::from(closed);
                Ok(())
            }
            None => Err(ServiceError::api("disableActivity", "活动不存在")),
        }
    }

    async fn delete_activity(
        &self,
        _credentials: &ScmCredentials,
        activity_id: i64,
    ) -> ServiceResult<()> {
        self.record("deleteActivity");
        self.activities.lock().unwrap().remove(&activity_id);
        Ok(())
    }

    async fn area_tree(&self, _credentials: &ScmCredentials) -> ServiceResult<Value> {
        self.record("getAreaTree");
        Ok(json!([{"id": 1, "name": "华东"}]))
    }
}

/// 记录每次赠券的开始/结束时间，可指定某张券失败
#[derive(Default)]
pub struct FakeGateway {
    pub fail_coupon: Option<String>,
    pub calls: Mutex<Vec<(String, Instant, Instant)>>,
    pub work: std::time::Duration,
}

impl FakeGateway {
    pub fn failing(coupon_id: &str) -> Self {
        Self {
            fail_coupon: Some(coupon_id.to_string()),
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl GiftGateway for FakeGateway {
    async fn give_all(&self, request: &GiftRequest) -> ServiceResult<GiftResponse> {
        let started = Instant::now();
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((request.coupon_type_id.clone(), started, Instant::now()));
        if self.fail_coupon.as_deref() == Some(request.coupon_type_id.as_str()) {
            return Err(ServiceError::api("giveAll", "门店不存在"));
        }
        let targets: Vec<String> = request
            .input_text
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(GiftResponse {
            success: true,
            data: Some(GiftBreakdown {
                success: targets,
                failed: BTreeMap::new(),
            }),
            message: String::new(),
        })
    }
}
