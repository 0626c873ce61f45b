use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use herdbook_circles::{CircleEvent, CircleId, CircleStatus, ResourceRef, UnitDelta};
use herdbook_core::{AggregateId, TenantId};
use herdbook_events::EventEnvelope;

use crate::read_model::TenantStore;

/// Remaining stock per resource for one circle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRow {
    pub resource: ResourceRef,
    pub allocated: i64,
    pub remaining: i64,
}

/// Queryable circle read model: live unit counters and stock balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircleSummary {
    pub circle_id: CircleId,
    pub status: CircleStatus,
    pub total_unit: i64,
    pub good_units: i64,
    pub bad_units: i64,
    pub dead_units: i64,
    pub active_reports: u64,
    pub stock: Vec<StockRow>,
}

impl CircleSummary {
    pub fn remaining(&self, resource: &ResourceRef) -> Option<i64> {
        self.stock
            .iter()
            .find(|r| r.resource == *resource)
            .map(|r| r.remaining)
    }

    fn apply_units(&mut self, delta: &UnitDelta) {
        self.dead_units += delta.dead;
        self.bad_units += delta.bad;
        self.good_units -= delta.total();
    }

    fn reverse_units(&mut self, delta: &UnitDelta) {
        self.dead_units -= delta.dead;
        self.bad_units -= delta.bad;
        self.good_units += delta.total();
    }

    fn debit(&mut self, resource: &ResourceRef, quantity: i64) {
        if let Some(row) = self.stock.iter_mut().find(|r| r.resource == *resource) {
            row.remaining -= quantity;
        }
    }

    fn credit(&mut self, resource: &ResourceRef, quantity: i64) {
        if let Some(row) = self.stock.iter_mut().find(|r| r.resource == *resource) {
            row.remaining += quantity;
        }
    }
}

/// Tenant+aggregate cursor to support at-least-once delivery (idempotent projection).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum CircleProjectionError {
    #[error("failed to deserialize circle event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Circle stock projection.
///
/// Consumes published envelopes (JSON payloads) and maintains a
/// tenant-isolated summary per circle. The read model is disposable and can
/// be rebuilt from the event stream.
#[derive(Debug)]
pub struct CircleStockProjection<S>
where
    S: TenantStore<CircleId, CircleSummary>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> CircleStockProjection<S>
where
    S: TenantStore<CircleId, CircleSummary>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId, circle_id: &CircleId) -> Option<CircleSummary> {
        self.store.get(tenant_id, circle_id)
    }

    /// List all circles for a tenant (disposable read model).
    pub fn list(&self, tenant_id: TenantId) -> Vec<CircleSummary> {
        self.store.list(tenant_id)
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Enforces tenant isolation
    /// - Enforces monotonic sequence per (tenant, aggregate) stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), CircleProjectionError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        // Cursor check (per tenant + aggregate stream).
        if let Ok(mut cursors) = self.cursors.write() {
            let key = CursorKey {
                tenant_id,
                aggregate_id,
            };
            let last = *cursors.get(&key).unwrap_or(&0);

            if seq == 0 {
                return Err(CircleProjectionError::NonMonotonicSequence { last, found: seq });
            }

            if seq <= last {
                // Duplicate or replay; safe to ignore.
                return Ok(());
            }

            if seq != last + 1 && last != 0 {
                // The first observed event may carry any positive sequence,
                // after that strict increments are required.
                return Err(CircleProjectionError::NonMonotonicSequence { last, found: seq });
            }

            let event: CircleEvent = serde_json::from_value(envelope.payload().clone())
                .map_err(|e| CircleProjectionError::Deserialize(e.to_string()))?;

            // Validate tenant isolation at the event level.
            let (event_tenant, circle_id) = event_scope(&event);
            if event_tenant != tenant_id {
                return Err(CircleProjectionError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }
            if circle_id.0 != aggregate_id {
                return Err(CircleProjectionError::TenantIsolation(
                    "event circle_id does not match envelope aggregate_id".to_string(),
                ));
            }

            self.apply_event(tenant_id, circle_id, &event);

            // Advance cursor after successful apply.
            cursors.insert(key, seq);
        }

        Ok(())
    }

    fn apply_event(&self, tenant_id: TenantId, circle_id: CircleId, event: &CircleEvent) {
        match event {
            CircleEvent::CircleStarted(e) => {
                self.store.upsert(
                    tenant_id,
                    circle_id,
                    CircleSummary {
                        circle_id,
                        status: CircleStatus::Growing,
                        total_unit: e.total_unit,
                        good_units: e.total_unit,
                        bad_units: 0,
                        dead_units: 0,
                        active_reports: 0,
                        stock: Vec::new(),
                    },
                );
            }
            CircleEvent::StockAllocated(e) => {
                self.update(tenant_id, circle_id, |summary| {
                    match summary.stock.iter_mut().find(|r| r.resource == e.resource) {
                        Some(row) => {
                            row.allocated += e.quantity;
                            row.remaining += e.quantity;
                        }
                        None => summary.stock.push(StockRow {
                            resource: e.resource,
                            allocated: e.quantity,
                            remaining: e.quantity,
                        }),
                    }
                });
            }
            CircleEvent::DailyReportSubmitted(e) => {
                self.update(tenant_id, circle_id, |summary| {
                    summary.apply_units(&UnitDelta::new(e.dead_units, e.bad_units));
                    for line in &e.lines {
                        summary.debit(&line.resource, line.quantity);
                    }
                    summary.active_reports += 1;
                });
            }
            CircleEvent::DailyReportRevised(e) => {
                self.update(tenant_id, circle_id, |summary| {
                    summary.reverse_units(&e.old_delta);
                    summary.apply_units(&e.new_delta);
                    // Credits before debits, in the same order the aggregate
                    // replays the revision.
                    for change in &e.changes {
                        if let Some(old) = change.old_quantity {
                            summary.credit(&change.resource, old);
                        }
                    }
                    for change in &e.changes {
                        if let Some(new) = change.new_quantity {
                            summary.debit(&change.resource, new);
                        }
                    }
                });
            }
            CircleEvent::DailyReportRetracted(e) => {
                self.update(tenant_id, circle_id, |summary| {
                    summary.reverse_units(&e.delta);
                    for credit in &e.credits {
                        if let Some(old) = credit.old_quantity {
                            summary.credit(&credit.resource, old);
                        }
                    }
                    summary.active_reports = summary.active_reports.saturating_sub(1);
                });
            }
            // Attachment metadata does not affect the stock summary.
            CircleEvent::ReportImagesCleared(_) | CircleEvent::ReportImageAttached(_) => {}
            CircleEvent::CircleClosed(_) => {
                self.update(tenant_id, circle_id, |summary| {
                    summary.status = CircleStatus::Closed;
                });
            }
        }
    }

    fn update(
        &self,
        tenant_id: TenantId,
        circle_id: CircleId,
        f: impl FnOnce(&mut CircleSummary),
    ) {
        if let Some(mut summary) = self.store.get(tenant_id, &circle_id) {
            f(&mut summary);
            self.store.upsert(tenant_id, circle_id, summary);
        }
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), CircleProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();

        // Clear read model per tenant before rebuilding.
        {
            let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
            tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
            tenants.dedup();
            for t in tenants {
                self.store.clear_tenant(t);
            }
        }

        // Deterministic replay order: tenant, aggregate, sequence.
        envs.sort_by_key(|e| {
            (
                *e.tenant_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}

fn event_scope(event: &CircleEvent) -> (TenantId, CircleId) {
    match event {
        CircleEvent::CircleStarted(e) => (e.tenant_id, e.circle_id),
        CircleEvent::StockAllocated(e) => (e.tenant_id, e.circle_id),
        CircleEvent::DailyReportSubmitted(e) => (e.tenant_id, e.circle_id),
        CircleEvent::DailyReportRevised(e) => (e.tenant_id, e.circle_id),
        CircleEvent::ReportImagesCleared(e) => (e.tenant_id, e.circle_id),
        CircleEvent::DailyReportRetracted(e) => (e.tenant_id, e.circle_id),
        CircleEvent::ReportImageAttached(e) => (e.tenant_id, e.circle_id),
        CircleEvent::CircleClosed(e) => (e.tenant_id, e.circle_id),
    }
}
