//! Integration tests for the full reconciliation pipeline.
//!
//! Command → EventStore → EventBus → Projection → ReadModel, plus the image
//! side-channel. Verifies that report operations keep the unit and stock
//! ledgers consistent end to end, that tenants stay isolated, and that two
//! writers racing on one allocation serialize instead of over-debiting.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;

use herdbook_circles::{
    CircleId, CircleStatus, LineId, LineRequest, ReportId, ResourceId, ResourceRef,
};
use herdbook_core::{AggregateId, TenantId, UserId};
use herdbook_events::{EventBus, EventEnvelope, InMemoryEventBus};
use herdbook_media::{ImagePayload, InMemoryImageStore};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::projections::{CircleStockProjection, CircleSummary};
use crate::read_model::InMemoryTenantStore;
use crate::reports::{CreateReportRequest, DailyReportService, NewImage, ReviseReportRequest};

type TestBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type TestService = DailyReportService<Arc<InMemoryEventStore>, TestBus, Arc<InMemoryImageStore>>;
type TestProjection = CircleStockProjection<Arc<InMemoryTenantStore<CircleId, CircleSummary>>>;

struct Harness {
    service: Arc<TestService>,
    projection: Arc<TestProjection>,
    images: Arc<InMemoryImageStore>,
    store: Arc<InMemoryEventStore>,
    tenant_id: TenantId,
    actor_id: UserId,
}

fn setup() -> Harness {
    herdbook_observability::init();

    let store = Arc::new(InMemoryEventStore::new());
    let bus: TestBus = Arc::new(InMemoryEventBus::new());
    let images = Arc::new(InMemoryImageStore::new());
    let dispatcher = CommandDispatcher::new(store.clone(), bus.clone());
    let service = Arc::new(DailyReportService::new(dispatcher, images.clone()));

    let read_model_store: Arc<InMemoryTenantStore<CircleId, CircleSummary>> =
        Arc::new(InMemoryTenantStore::new());
    let projection = Arc::new(CircleStockProjection::new(read_model_store));

    // Subscribe to the bus BEFORE any events are published.
    let projection_clone = projection.clone();
    let bus_clone = bus.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    std::thread::spawn(move || {
        let sub = bus_clone.subscribe();
        let _ = ready_tx.send(());
        while let Ok(env) = sub.recv() {
            if let Err(e) = projection_clone.apply_envelope(&env) {
                eprintln!("failed to apply envelope: {e:?}");
            }
        }
    });
    let _ = ready_rx.recv_timeout(std::time::Duration::from_secs(1));

    Harness {
        service,
        projection,
        images,
        store,
        tenant_id: TenantId::new(),
        actor_id: UserId::new(),
    }
}

fn wait_for_processing() {
    std::thread::sleep(std::time::Duration::from_millis(50));
}

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
}

/// Start a circle with 100 units and allocate `feed_quantity` of one feed
/// resource; returns the circle and resource identifiers.
fn seeded_circle(h: &Harness, feed_quantity: i64) -> (CircleId, ResourceRef) {
    let circle_id = CircleId::new(AggregateId::new());
    let feed = ResourceRef::food(ResourceId::new());

    h.service
        .start_circle(h.tenant_id, h.actor_id, circle_id, start_date(), 100)
        .unwrap();
    h.service
        .allocate_stock(h.tenant_id, h.actor_id, circle_id, feed, feed_quantity)
        .unwrap();

    (circle_id, feed)
}

fn report_request(
    circle_id: CircleId,
    feed: ResourceRef,
    quantity: i64,
    images: Vec<NewImage>,
) -> CreateReportRequest {
    CreateReportRequest {
        circle_id,
        report_id: ReportId::new(),
        report_date: start_date(),
        dead_units: 3,
        bad_units: 2,
        note: "routine".to_string(),
        lines: vec![LineRequest {
            line_id: LineId::new(),
            resource: feed,
            quantity,
        }],
        images,
    }
}

#[test]
fn submitted_report_updates_read_model() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    h.service
        .create_report(
            h.tenant_id,
            h.actor_id,
            report_request(circle_id, feed, 10, vec![]),
        )
        .unwrap();
    wait_for_processing();

    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.good_units, 95);
    assert_eq!(summary.dead_units, 3);
    assert_eq!(summary.bad_units, 2);
    assert_eq!(summary.remaining(&feed), Some(40));
    assert_eq!(summary.active_reports, 1);
    assert_eq!(summary.status, CircleStatus::Growing);
}

#[test]
fn retraction_restores_read_model() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    let request = report_request(circle_id, feed, 10, vec![]);
    let report_id = request.report_id;
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();

    h.service
        .disable_report(h.tenant_id, h.actor_id, circle_id, report_id)
        .unwrap();
    wait_for_processing();

    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.good_units, 100);
    assert_eq!(summary.dead_units, 0);
    assert_eq!(summary.remaining(&feed), Some(50));
    assert_eq!(summary.active_reports, 0);
}

#[test]
fn revision_reapplies_instead_of_accumulating() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    let request = report_request(circle_id, feed, 10, vec![]);
    let report_id = request.report_id;
    let line_id = request.lines[0].line_id;
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();

    h.service
        .update_report(
            h.tenant_id,
            h.actor_id,
            ReviseReportRequest {
                circle_id,
                report_id,
                dead_units: 5,
                bad_units: 0,
                note: "corrected".to_string(),
                lines: vec![LineRequest {
                    line_id,
                    resource: feed,
                    quantity: 4,
                }],
                images: vec![],
            },
        )
        .unwrap();
    wait_for_processing();

    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.dead_units, 5);
    assert_eq!(summary.bad_units, 0);
    assert_eq!(summary.good_units, 95);
    assert_eq!(summary.remaining(&feed), Some(46));
    assert_eq!(summary.active_reports, 1);
}

#[test]
fn concurrent_debits_never_oversell_the_allocation() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 10);

    // Two writers each want 6 of a 10-unit allocation. Exactly one can win;
    // the loser retries on the version conflict and then fails the
    // sufficiency check.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let service = h.service.clone();
        let tenant_id = h.tenant_id;
        let actor_id = h.actor_id;
        handles.push(std::thread::spawn(move || {
            service.create_report(tenant_id, actor_id, report_request(circle_id, feed, 6, vec![]))
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|j| j.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);

    let losers: Vec<_> = results.into_iter().filter_map(Result::err).collect();
    assert_eq!(losers.len(), 1);
    assert!(matches!(losers[0], DispatchError::InsufficientStock(_)));

    wait_for_processing();
    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.remaining(&feed), Some(4));
}

#[test]
fn tenant_isolation_preserved() {
    let h = setup();
    let other_tenant = TenantId::new();

    let (circle_id, _) = seeded_circle(&h, 50);

    let other_circle = CircleId::new(AggregateId::new());
    h.service
        .start_circle(other_tenant, h.actor_id, other_circle, start_date(), 30)
        .unwrap();

    wait_for_processing();

    let mine = h.projection.list(h.tenant_id);
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].circle_id, circle_id);

    let theirs = h.projection.list(other_tenant);
    assert_eq!(theirs.len(), 1);
    assert_eq!(theirs[0].circle_id, other_circle);

    assert!(h.projection.get(h.tenant_id, &other_circle).is_none());
    assert!(h.projection.get(other_tenant, &circle_id).is_none());
}

#[test]
fn rejected_report_does_not_touch_the_read_model() {
    let h = setup();

    // Circle that starts after the report date.
    let circle_id = CircleId::new(AggregateId::new());
    let feed = ResourceRef::food(ResourceId::new());
    h.service
        .start_circle(
            h.tenant_id,
            h.actor_id,
            circle_id,
            start_date() + chrono::Days::new(1),
            100,
        )
        .unwrap();
    h.service
        .allocate_stock(h.tenant_id, h.actor_id, circle_id, feed, 50)
        .unwrap();

    let result = h.service.create_report(
        h.tenant_id,
        h.actor_id,
        report_request(circle_id, feed, 10, vec![]),
    );
    assert!(matches!(result, Err(DispatchError::InvalidState(_))));

    wait_for_processing();
    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.good_units, 100);
    assert_eq!(summary.remaining(&feed), Some(50));
    assert_eq!(summary.active_reports, 0);
}

#[test]
fn images_are_uploaded_on_create_and_deleted_on_disable() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    let request = report_request(
        circle_id,
        feed,
        10,
        vec![NewImage {
            payload: ImagePayload::new("aGVyZA==").unwrap(),
            is_thumbnail: true,
        }],
    );
    let report_id = request.report_id;
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();
    assert_eq!(h.images.len(), 1);

    h.service
        .disable_report(h.tenant_id, h.actor_id, circle_id, report_id)
        .unwrap();
    assert!(h.images.is_empty());
}

#[test]
fn revision_replaces_the_attachment_set() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    let request = report_request(
        circle_id,
        feed,
        10,
        vec![NewImage {
            payload: ImagePayload::new("b2xk").unwrap(),
            is_thumbnail: false,
        }],
    );
    let report_id = request.report_id;
    let line_id = request.lines[0].line_id;
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();
    assert_eq!(h.images.len(), 1);

    // Revision with no new images: the old binary is removed remotely.
    h.service
        .update_report(
            h.tenant_id,
            h.actor_id,
            ReviseReportRequest {
                circle_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![LineRequest {
                    line_id,
                    resource: feed,
                    quantity: 10,
                }],
                images: vec![],
            },
        )
        .unwrap();
    assert!(h.images.is_empty());
}

#[test]
fn image_store_outage_does_not_fail_the_submission() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);
    h.images.set_fail_uploads(true);

    let request = report_request(
        circle_id,
        feed,
        10,
        vec![NewImage {
            payload: ImagePayload::new("aGVyZA==").unwrap(),
            is_thumbnail: false,
        }],
    );
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();

    wait_for_processing();
    let summary = h.projection.get(h.tenant_id, &circle_id).unwrap();
    assert_eq!(summary.remaining(&feed), Some(40));
    assert!(h.images.is_empty());
}

#[test]
fn projection_rebuilds_from_the_event_stream() {
    let h = setup();
    let (circle_id, feed) = seeded_circle(&h, 50);

    let request = report_request(circle_id, feed, 10, vec![]);
    let report_id = request.report_id;
    h.service.create_report(h.tenant_id, h.actor_id, request).unwrap();
    h.service
        .disable_report(h.tenant_id, h.actor_id, circle_id, report_id)
        .unwrap();
    wait_for_processing();

    let expected = h.projection.get(h.tenant_id, &circle_id).unwrap();

    let fresh: Arc<InMemoryTenantStore<CircleId, CircleSummary>> =
        Arc::new(InMemoryTenantStore::new());
    let rebuilt = CircleStockProjection::new(fresh);
    let envelopes = h
        .store
        .load_stream(h.tenant_id, circle_id.0)
        .unwrap()
        .iter()
        .map(|e| e.to_envelope())
        .collect::<Vec<_>>();
    rebuilt.rebuild_from_scratch(envelopes).unwrap();

    assert_eq!(rebuilt.get(h.tenant_id, &circle_id).unwrap(), expected);
}
