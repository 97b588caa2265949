mod common;

use common::{FakeGateway, StaticCredentials};
use lezhiquan::commands::{CommandRouter, TOOL_LIST_SHARED, TOOL_SEND_COUPONS};
use lezhiquan::dispatch::DispatchExecutor;
use lezhiquan::models::{DispatchConfig, SharedCouponRecord};
use lezhiquan::shared_state::{MemoryStore, SharedKey, SharedStateStore};
use std::sync::Arc;

async fn shared(store: &MemoryStore, coupon_id: &str, keyword: &str, sharing: bool) {
    store
        .set(
            &SharedKey::new("P100", coupon_id),
            &SharedCouponRecord {
                sharing,
                keyword: keyword.to_string(),
                name: format!("券{coupon_id}"),
                per_store_limit: 5,
                total_amount: 10000,
                issued_total: 0,
                updated_at: 1,
            },
        )
        .await
        .unwrap();
}

async fn router(gateway: &Arc<FakeGateway>) -> (CommandRouter, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    shared(&store, "C1", "3000/98折", true).await;
    shared(&store, "C2", "2000/99折", true).await;
    shared(&store, "C3", "2000/95折", false).await;
    let dispatcher = Arc::new(
        DispatchExecutor::new(
            gateway.clone(),
            Arc::new(StaticCredentials::logged_in()),
            DispatchConfig::default(),
        )
        .with_issued_tracking(store.clone(), "P100"),
    );
    (CommandRouter::new(store.clone(), "P100", dispatcher), store)
}

#[tokio::test]
async fn list_command_shows_only_sharing_coupons() {
    let gateway = Arc::new(FakeGateway::default());
    let (router, _) = router(&gateway).await;

    let reply = router.handle("@活动", |_| {}).await.unwrap().unwrap();
    assert!(reply.contains("3000/98折"));
    assert!(reply.contains("2000/99折"));
    assert!(!reply.contains("2000/95折"));
}

#[tokio::test(start_paused = true)]
async fn gift_sends_matched_coupon_and_counts_delivery() {
    let gateway = Arc::new(FakeGateway::default());
    let (router, store) = router(&gateway).await;
    let mut events = 0;

    let reply = router
        .handle("送3000/98折给 S001 S002", |_| events += 1)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(gateway.attempted(), vec!["C1"]);
    assert_eq!(events, 2);
    assert!(reply.contains("成功 2 个"));
    let record = store.get(&SharedKey::new("P100", "C1")).await.unwrap().unwrap();
    assert_eq!(record.issued_total, 2);
}

#[tokio::test]
async fn unmatched_description_lists_available_keywords() {
    let gateway = Arc::new(FakeGateway::default());
    let (router, _) = router(&gateway).await;

    // C3 没有开启共享，不参与匹配
    let reply = router
        .handle("送2000/95折给 S001", |_| {})
        .await
        .unwrap()
        .unwrap();
    assert!(reply.contains("未找到「2000/95折」"));
    assert!(reply.contains("3000/98折"));
    assert!(gateway.attempted().is_empty());
}

#[tokio::test]
async fn plain_chat_is_not_a_command() {
    let gateway = Arc::new(FakeGateway::default());
    let (router, _) = router(&gateway).await;
    assert!(router.handle("今天有什么活动吗", |_| {}).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn tool_calls_reuse_the_same_pipeline() {
    let gateway = Arc::new(FakeGateway::default());
    let (router, _) = router(&gateway).await;

    let listed = router
        .handle_tool_call(TOOL_LIST_SHARED, "{}", |_| {})
        .await
        .unwrap();
    assert!(listed.contains("2000/99折"));

    let sent = router
        .handle_tool_call(
            TOOL_SEND_COUPONS,
            r#"{"coupons": "99折", "targets": "13800001111"}"#,
            |_| {},
        )
        .await
        .unwrap();
    assert!(sent.contains("成功 1 个"));
    assert_eq!(gateway.attempted(), vec!["C2"]);

    assert!(router.handle_tool_call("unknown", "{}", |_| {}).await.is_err());
}
