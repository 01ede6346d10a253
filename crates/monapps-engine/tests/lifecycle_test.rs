// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for structural changes to the hierarchy.

mod common;

use common::{DEBOUNCE_MS, TestContext, drain};
use monapps_core::model::{HealthGrade, MAX_TS_MS, ReevalFields};
use monapps_core::persistence::{NewApplication, NewAsset, NewDatastream, NewDevice};
use monapps_engine::Error;
use monapps_engine::lifecycle::Lifecycle;
use serde_json::json;

fn lifecycle(ctx: &TestContext) -> Lifecycle {
    Lifecycle::new(ctx.ctx.clone())
}

fn new_datastream(device_id: i64, name: &str) -> NewDatastream {
    NewDatastream {
        device_id,
        name: name.to_string(),
        is_enabled: true,
        is_value_integer: false,
        time_update: Some(60_000),
        time_nd_health_error: 600_000,
        created_ts: 0,
    }
}

#[tokio::test]
async fn test_create_asset_marks_parent_and_publishes() {
    let ctx = TestContext::new(2_000).await;
    let mut rx = ctx.subscribe();
    let parent = ctx.asset("plant", None).await;

    let child = lifecycle(&ctx)
        .create_asset(NewAsset {
            name: "line 1".into(),
            parent_id: Some(parent),
            created_ts: 2_000,
        })
        .await
        .unwrap();
    assert_eq!(child.parent_id, Some(parent));
    assert_eq!(child.health, HealthGrade::Undefined);

    let parent = ctx.load_asset(parent).await;
    assert_eq!(parent.reeval_fields, ReevalFields::ALL);
    assert_eq!(parent.next_upd_ts, 2_000 + DEBOUNCE_MS);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, format!("procdata/test/asset/{}", child.id));
    assert_eq!(messages[0].payload["messageType"], "c");
    assert_eq!(messages[0].payload["name"], "line 1");
    assert!(messages[0].retain);
}

#[tokio::test]
async fn test_create_root_asset_marks_nothing() {
    let ctx = TestContext::new(2_000).await;
    let asset = lifecycle(&ctx)
        .create_asset(NewAsset {
            name: "root".into(),
            parent_id: None,
            created_ts: 2_000,
        })
        .await
        .unwrap();
    assert_eq!(ctx.load_asset(asset.id).await.next_upd_ts, MAX_TS_MS);
}

#[tokio::test]
async fn test_create_device_lowercases_identifier() {
    let ctx = TestContext::new(2_000).await;
    let parent = ctx.asset("plant", None).await;

    let device = lifecycle(&ctx)
        .create_device(NewDevice {
            dev_ui: "AB-CD-01".into(),
            name: "Meter".into(),
            parent_id: Some(parent),
            created_ts: 2_000,
        })
        .await
        .unwrap();
    assert_eq!(device.dev_ui, "ab-cd-01");
    assert_eq!(ctx.load_asset(parent).await.reeval_fields, ReevalFields::ALL);
}

#[tokio::test]
async fn test_datastream_changes_mark_device() {
    let ctx = TestContext::new(2_000).await;
    let device = ctx.device("dev-01", None).await;
    let lifecycle = lifecycle(&ctx);

    let ds = lifecycle
        .create_datastream(new_datastream(device, "temp"))
        .await
        .unwrap();
    assert_eq!(ds.health_next_eval_ts, 0);
    assert_eq!(ctx.load_device(device).await.next_upd_ts, 2_000 + DEBOUNCE_MS);

    // Consume the mark, then delete.
    ctx.update_device(device, |d| d.next_upd_ts = MAX_TS_MS).await;
    ctx.set_now(5_000);
    assert!(lifecycle.delete_datastream(ds.id).await.unwrap());
    assert_eq!(ctx.load_device(device).await.next_upd_ts, 5_000 + DEBOUNCE_MS);
    assert!(!lifecycle.delete_datastream(ds.id).await.unwrap());
}

#[tokio::test]
async fn test_create_application_schedules_first_run() {
    let ctx = TestContext::new(2_000).await;
    let parent = ctx.asset("plant", None).await;
    let type_id = ctx.app_type("monitoring", "monitoring", json!({})).await;

    let mut new = NewApplication::new(type_id, "0.0.1", 3_000);
    new.parent_id = Some(parent);
    let app = lifecycle(&ctx).create_application(new).await.unwrap();

    assert_eq!(app.func_name, "monitoring");
    let schedule = ctx.load_schedule(app.id).await;
    assert_eq!(schedule.next_run_ts, 3_000);
    assert_eq!(schedule.interval_ms, 60_000);
    assert!(schedule.is_enabled);
    assert_eq!(ctx.load_asset(parent).await.reeval_fields, ReevalFields::ALL);
}

#[tokio::test]
async fn test_delete_device_removes_channels_and_publishes() {
    let ctx = TestContext::new(2_000).await;
    let parent = ctx.asset("plant", None).await;
    let device = ctx.device("dev-01", Some(parent)).await;
    let ds = ctx.datastream(device, "temp", None).await;
    let mut rx = ctx.subscribe();

    let lifecycle = lifecycle(&ctx);
    assert!(lifecycle.delete_device(device).await.unwrap());

    let mut tx = monapps_core::Store::begin(&*ctx.store).await.unwrap();
    assert!(tx.lock_datastream(ds).await.unwrap().is_none());
    tx.commit().await.unwrap();

    let topics: Vec<_> = drain(&mut rx).into_iter().map(|m| m.topic).collect();
    assert_eq!(
        topics,
        vec![
            format!("procdata/test/datastream/{ds}"),
            format!("procdata/test/device/{device}"),
        ]
    );
    assert_eq!(ctx.load_asset(parent).await.reeval_fields, ReevalFields::ALL);

    assert!(!lifecycle.delete_device(device).await.unwrap());
}

#[tokio::test]
async fn test_datastream_bound_to_feed_cannot_be_deleted() {
    let ctx = TestContext::new(2_000).await;
    let device = ctx.device("dev-01", None).await;
    let ds = ctx.datastream(device, "temp", None).await;
    let type_id = ctx.app_type("monitoring", "monitoring", json!({})).await;
    let app = ctx.application(type_id, None, |_| {}).await;
    ctx.datafeed(app, "temp", Some(ds), false).await;

    assert!(lifecycle(&ctx).delete_datastream(ds).await.is_err());
    assert_eq!(ctx.load_datastream(ds).await.id, ds);
}

#[tokio::test]
async fn test_delete_application_publishes_feeds_and_app() {
    let ctx = TestContext::new(2_000).await;
    let parent = ctx.asset("plant", None).await;
    let type_id = ctx.app_type("signals", "test", common::status_schema()).await;
    let app = ctx.application(type_id, Some(parent), |_| {}).await;
    let feed = ctx.datafeed(app, "Status", None, true).await;
    let mut rx = ctx.subscribe();

    assert!(lifecycle(&ctx).delete_application(app).await.unwrap());

    let messages = drain(&mut rx);
    let topics: Vec<_> = messages.iter().map(|m| m.topic.clone()).collect();
    assert_eq!(
        topics,
        vec![
            format!("procdata/test/datafeed/{feed}"),
            format!("procdata/test/application/{app}"),
        ]
    );
    assert!(messages.iter().all(|m| m.payload["messageType"] == "d"));
    assert_eq!(ctx.load_asset(parent).await.reeval_fields, ReevalFields::ALL);
}

#[tokio::test]
async fn test_set_application_enabled() {
    let ctx = TestContext::new(2_000).await;
    let parent = ctx.asset("plant", None).await;
    let type_id = ctx.app_type("monitoring", "monitoring", json!({})).await;
    let app = ctx.application(type_id, Some(parent), |_| {}).await;
    ctx.update_application(app, |a| a.health = HealthGrade::Error).await;
    let mut rx = ctx.subscribe();
    let lifecycle = lifecycle(&ctx);

    assert!(lifecycle.set_application_enabled(app, false).await.unwrap());
    let loaded = ctx.load_application(app).await;
    assert!(!loaded.is_enabled);
    assert_eq!(loaded.health, HealthGrade::Undefined);
    assert_eq!(ctx.load_asset(parent).await.reeval_fields, ReevalFields::ALL);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload["isEnabled"], false);
    assert_eq!(messages[0].payload["health"], 0);

    // No-op when already in the requested state.
    assert!(!lifecycle.set_application_enabled(app, false).await.unwrap());
    assert!(drain(&mut rx).is_empty());

    assert!(lifecycle.set_application_enabled(app, true).await.unwrap());
    assert!(ctx.load_application(app).await.is_enabled);

    let err = lifecycle.set_application_enabled(999, true).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { entity: "application", .. }));
}
