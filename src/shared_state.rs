//! 共享状态库：Firebase `yhq_gx/{providerId}/{couponId}`。
//!
//! 所有写入都是普通的 update/set/remove，没有事务，也没有版本号，后写覆盖先写。

use crate::error::{ServiceError, ServiceResult};
use crate::models::{FirebaseConfig, SharedCouponRecord, SharedRecordPatch};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

pub const ROOT: &str = "yhq_gx";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedKey {
    pub provider_id: String,
    pub coupon_id: String,
}

impl SharedKey {
    pub fn new(provider_id: impl Into<String>, coupon_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            coupon_id: coupon_id.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{ROOT}/{}/{}", self.provider_id, self.coupon_id)
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[async_trait]
pub trait SharedStateStore: Send + Sync {
    async fn get(&self, key: &SharedKey) -> ServiceResult<Option<SharedCouponRecord>>;

    async fn update(&self, key: &SharedKey, patch: &SharedRecordPatch) -> ServiceResult<()>;

    async fn set(&self, key: &SharedKey, record: &SharedCouponRecord) -> ServiceResult<()>;

    async fn remove(&self, key: &SharedKey) -> ServiceResult<()>;

    /// 某个供应商下的全部记录，couponId -> 记录
    async fn list(&self, provider_id: &str)
    -> ServiceResult<BTreeMap<String, SharedCouponRecord>>;

    /// 实时监听一条记录，每次远端变化都会推送最新值
    async fn watch(
        &self,
        key: &SharedKey,
    ) -> ServiceResult<watch::Receiver<Option<SharedCouponRecord>>>;
}

/// 进程内实现，语义与 Firebase 一致
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<SharedKey, SharedCouponRecord>>,
    watchers: Mutex<HashMap<SharedKey, watch::Sender<Option<SharedCouponRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_records(
        &self,
    ) -> ServiceResult<std::sync::MutexGuard<'_, BTreeMap<SharedKey, SharedCouponRecord>>> {
        self.records
            .lock()
            .map_err(|_| ServiceError::Store("内存存储锁已损坏".to_string()))
    }

    fn notify(&self, key: &SharedKey, value: Option<SharedCouponRecord>) {
        if let Ok(watchers) = self.watchers.lock() {
            if let Some(sender) = watchers.get(key) {
                sender.send_replace(value);
            }
        }
    }
}

#[async_trait]
impl SharedStateStore for MemoryStore {
    async fn get(&self, key: &SharedKey) -> ServiceResult<Option<SharedCouponRecord>> {
        Ok(self.lock_records()?.get(key).cloned())
    }

    async fn update(&self, key: &SharedKey, patch: &SharedRecordPatch) -> ServiceResult<()> {
        let updated = {
            let mut records = self.lock_records()?;
            let record = records.entry(key.clone()).or_default();
            patch.apply_to(record);
            record.clone()
        };
        self.notify(key, Some(updated));
        Ok(())
    }

    async fn set(&self, key: &SharedKey, record: &SharedCouponRecord) -> ServiceResult<()> {
        self.lock_records()?.insert(key.clone(), record.clone());
        self.notify(key, Some(record.clone()));
        Ok(())
    }

    async fn remove(&self, key: &SharedKey) -> ServiceResult<()> {
        self.lock_records()?.remove(key);
        self.notify(key, None);
        Ok(())
    }

    async fn list(
        &self,
        provider_id: &str,
    ) -> ServiceResult<BTreeMap<String, SharedCouponRecord>> {
        Ok(self
            .lock_records()?
            .iter()
            .filter(|(key, _)| key.provider_id == provider_id)
            .map(|(key, record)| (key.coupon_id.clone(), record.clone()))
            .collect())
    }

    async fn watch(
        &self,
        key: &SharedKey,
    ) -> ServiceResult<watch::Receiver<Option<SharedCouponRecord>>> {
        let current = self.lock_records()?.get(key).cloned();
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| ServiceError::Store("监听表锁已损坏".to_string()))?;
        let sender = watchers
            .entry(key.clone())
            .or_insert_with(|| watch::channel(current).0);
        Ok(sender.subscribe())
    }
}

/// Firebase Realtime Database REST 实现
#[derive(Clone)]
pub struct FirebaseStore {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl FirebaseStore {
    pub fn new(config: &FirebaseConfig, timeout_secs: u64) -> ServiceResult<Self> {
        if config.database_url.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "firebase.database_url 未配置".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            base_url: config.database_url.trim_end_matches('/').to_string(),
            auth_token: config
                .auth_token
                .clone()
                .filter(|item| !item.trim().is_empty()),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, action: &str) -> ServiceResult<Value> {
        let response = builder.send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ServiceError::HttpStatus {
                action: action.to_string(),
                status,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SharedStateStore for FirebaseStore {
    async fn get(&self, key: &SharedKey) -> ServiceResult<Option<SharedCouponRecord>> {
        let value = self
            .send(self.request(reqwest::Method::GET, &key.path()), "firebase.get")
            .await?;
        decode_record(value)
    }

    async fn update(&self, key: &SharedKey, patch: &SharedRecordPatch) -> ServiceResult<()> {
        tracing::debug!("更新共享记录: {} {:?}", key, patch);
        self.send(
            self.request(reqwest::Method::PATCH, &key.path()).json(patch),
            "firebase.update",
        )
        .await?;
        Ok(())
    }

    async fn set(&self, key: &SharedKey, record: &SharedCouponRecord) -> ServiceResult<()> {
        self.send(
            self.request(reqwest::Method::PUT, &key.path()).json(record),
            "firebase.set",
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &SharedKey) -> ServiceResult<()> {
        self.send(
            self.request(reqwest::Method::DELETE, &key.path()),
            "firebase.remove",
        )
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        provider_id: &str,
    ) -> ServiceResult<BTreeMap<String, SharedCouponRecord>> {
        let value = self
            .send(
                self.request(reqwest::Method::GET, &format!("{ROOT}/{provider_id}")),
                "firebase.list",
            )
            .await?;
        let Value::Object(entries) = value else {
            return Ok(BTreeMap::new());
        };
        let mut records = BTreeMap::new();
        for (coupon_id, raw) in entries {
            match serde_json::from_value::<SharedCouponRecord>(raw) {
                Ok(record) => {
                    records.insert(coupon_id, record);
                }
                Err(e) => tracing::warn!("跳过无法解析的共享记录 {}: {}", coupon_id, e),
            }
        }
        Ok(records)
    }

    async fn watch(
        &self,
        key: &SharedKey,
    ) -> ServiceResult<watch::Receiver<Option<SharedCouponRecord>>> {
        let (tx, rx) = watch::channel(None);
        let store = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    result = store.stream_record(&key, &tx) => {
                        if let Err(e) = result {
                            tracing::warn!("共享记录监听中断，稍后重连: {} ({})", key, e);
                        }
                    }
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            tracing::debug!("共享记录监听结束: {}", key);
        });
        Ok(rx)
    }
}

impl FirebaseStore {
    /// 读取 REST streaming（text/event-stream），把 put/patch 应用到本地副本
    async fn stream_record(
        &self,
        key: &SharedKey,
        tx: &watch::Sender<Option<SharedCouponRecord>>,
    ) -> ServiceResult<()> {
        let response = self
            .request(reqwest::Method::GET, &key.path())
            .header(ACCEPT, "text/event-stream")
            .timeout(Duration::from_secs(24 * 3600))
            .send()
            .await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ServiceError::HttpStatus {
                action: "firebase.watch".to_string(),
                status,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut document = Value::Null;
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = find_event_end(&buffer) {
                let block: Vec<u8> = buffer.drain(..pos + 2).collect();
                let text = String::from_utf8_lossy(&block);
                let Some(event) = parse_sse_block(&text) else {
                    continue;
                };
                match event.name.as_str() {
                    "put" | "patch" => {
                        apply_stream_event(&mut document, &event.name, &event.data)?;
                        tx.send_replace(decode_record(document.clone())?);
                    }
                    "cancel" | "auth_revoked" => {
                        return Err(ServiceError::Store(format!(
                            "监听被服务端终止: {}",
                            event.name
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn decode_record(value: Value) -> ServiceResult<Option<SharedCouponRecord>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[derive(Debug, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut name = String::new();
    let mut data = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.trim_start().to_string());
        }
    }
    if name.is_empty() {
        return None;
    }
    Some(SseEvent {
        name,
        data: data.join("\n"),
    })
}

/// `{"path": "/guanjianzi", "data": ...}` 应用到文档
fn apply_stream_event(document: &mut Value, kind: &str, payload: &str) -> ServiceResult<()> {
    let payload: Value = serde_json::from_str(payload)?;
    let path = payload.get("path").and_then(Value::as_str).unwrap_or("/");
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let Some((last, parents)) = segments.split_last() else {
        match (kind, data) {
            ("patch", Value::Object(fields)) => merge_fields(document, fields),
            (_, data) => *document = data,
        }
        return Ok(());
    };

    let mut cursor = document;
    for segment in parents {
        cursor = child_object(cursor).entry(segment.to_string()).or_insert(Value::Null);
    }
    let parent = child_object(cursor);
    match (kind, data) {
        ("patch", Value::Object(fields)) => {
            let target = parent.entry(last.to_string()).or_insert(Value::Null);
            merge_fields(target, fields);
        }
        (_, Value::Null) => {
            parent.remove(*last);
        }
        (_, data) => {
            parent.insert(last.to_string(), data);
        }
    }
    Ok(())
}

fn child_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn merge_fields(target: &mut Value, fields: Map<String, Value>) {
    let object = child_object(target);
    for (field, value) in fields {
        if value.is_null() {
            object.remove(&field);
        } else {
            object.insert(field, value);
        }
    }
}
