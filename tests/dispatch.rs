mod common;

use common::{FakeGateway, StaticCredentials};
use lezhiquan::ServiceError;
use lezhiquan::dispatch::{CouponOutcome, DispatchEvent, DispatchExecutor};
use lezhiquan::models::{DispatchConfig, SelectedCoupon, SharedCouponRecord};
use lezhiquan::shared_state::{MemoryStore, SharedKey, SharedStateStore};
use std::sync::Arc;
use std::time::Duration;

fn selected(id: &str) -> SelectedCoupon {
    SelectedCoupon {
        id: id.to_string(),
        keyword: format!("{id} 3000/98折"),
        name: format!("券{id}"),
    }
}

fn executor(gateway: &Arc<FakeGateway>) -> DispatchExecutor {
    DispatchExecutor::new(
        gateway.clone(),
        Arc::new(StaticCredentials::logged_in()),
        DispatchConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn requests_are_spaced_and_failures_do_not_stop_queue() {
    let gateway = Arc::new(FakeGateway {
        work: Duration::from_millis(300),
        ..FakeGateway::failing("C2")
    });
    let executor = executor(&gateway);
    let coupons = vec![selected("C1"), selected("C2"), selected("C3")];
    let mut events = Vec::new();

    let summary = executor
        .send_coupon_queue(&coupons, "S001 S002", |event| events.push(event))
        .await
        .unwrap();

    assert_eq!(gateway.attempted(), vec!["C1", "C2", "C3"]);
    let calls = gateway.calls.lock().unwrap().clone();
    for pair in calls.windows(2) {
        let (_, _, previous_end) = &pair[0];
        let (_, next_start, _) = &pair[1];
        assert!(*next_start - *previous_end >= Duration::from_millis(2500));
    }

    assert_eq!(summary.delivered_count(), 2);
    assert_eq!(summary.failed_count(), 1);
    match &summary.results[1].1 {
        CouponOutcome::Failed { message } => assert_eq!(message, "门店不存在"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 每张券一个占位事件 + 一个完成事件，顺序与队列一致
    assert_eq!(events.len(), 6);
    assert!(matches!(
        &events[0],
        DispatchEvent::Sending { index: 1, total: 3, .. }
    ));
    assert!(matches!(
        &events[3],
        DispatchEvent::Finished { index: 2, outcome: CouponOutcome::Failed { .. }, .. }
    ));
    assert!(matches!(
        &events[5],
        DispatchEvent::Finished { index: 3, outcome: CouponOutcome::Delivered(_), .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn throttle_is_shared_between_queues() {
    let gateway = Arc::new(FakeGateway::default());
    let executor = executor(&gateway);
    let first = [selected("A1"), selected("A2")];
    let second = [selected("B1")];

    let (a, b) = tokio::join!(
        executor.send_coupon_queue(&first, "S001", |_| {}),
        executor.send_coupon_queue(&second, "S002", |_| {}),
    );
    a.unwrap();
    b.unwrap();

    let mut calls = gateway.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    calls.sort_by_key(|(_, start, _)| *start);
    for pair in calls.windows(2) {
        assert!(pair[1].1 - pair[0].2 >= Duration::from_millis(2500));
    }
}

#[tokio::test]
async fn empty_content_is_rejected_before_any_request() {
    let gateway = Arc::new(FakeGateway::default());
    let err = executor(&gateway)
        .send_coupon_queue(&[selected("C1")], "   ", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
    assert!(gateway.attempted().is_empty());
}

#[tokio::test]
async fn missing_login_is_reported() {
    let gateway = Arc::new(FakeGateway::default());
    let executor = DispatchExecutor::new(
        gateway.clone(),
        Arc::new(StaticCredentials(None)),
        DispatchConfig::default(),
    );
    let err = executor
        .send_coupon_queue(&[selected("C1")], "S001", |_| {})
        .await
        .unwrap_err();
    assert!(err.is_no_login());
    assert!(gateway.attempted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delivered_counts_accumulate_on_shared_record() {
    let gateway = Arc::new(FakeGateway::failing("C2"));
    let store = Arc::new(MemoryStore::new());
    let key = SharedKey::new("P100", "C1");
    store
        .set(
            &key,
            &SharedCouponRecord {
                sharing: true,
                keyword: "3000/98折".to_string(),
                issued_total: 3,
                ..SharedCouponRecord::default()
            },
        )
        .await
        .unwrap();
    let executor = executor(&gateway).with_issued_tracking(store.clone(), "P100");

    executor
        .send_coupon_queue(
            &[selected("C1"), selected("C2"), selected("C3")],
            "S001 S002",
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap().unwrap().issued_total, 5);
    // 没有共享记录的券不会被创建出记录
    assert!(store.get(&SharedKey::new("P100", "C3")).await.unwrap().is_none());
}
