//! Daily-report application service.
//!
//! Wraps the command dispatcher with two concerns the aggregate must not
//! carry:
//!
//! - **Optimistic retry.** Concurrent submissions against one circle race on
//!   the stream version; the loser reloads and re-decides. A request that is
//!   truly unsatisfiable (insufficient stock, invalid state) fails with the
//!   domain error, never with a raw concurrency conflict.
//! - **Image side-channel.** Binary uploads and deletions run after the
//!   ledger facts are durable and are strictly best-effort: a storage outage
//!   is logged and skipped, it never rolls back or fails the reconciliation.

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use herdbook_circles::{
    AllocateStock, AttachReportImage, CircleCommand, CircleEvent, CircleId, CloseCircle,
    LineRequest, LivestockCircle, ReportId, ResourceRef, RetractDailyReport, ReviseDailyReport,
    StartCircle, SubmitDailyReport,
};
use herdbook_core::{TenantId, UserId};
use herdbook_events::{EventBus, EventEnvelope};
use herdbook_media::{ImagePayload, ImageStore};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};

const AGGREGATE_TYPE: &str = "livestock.circle";

/// Bounded retry on optimistic concurrency conflicts.
const MAX_DISPATCH_ATTEMPTS: u32 = 5;

/// A new image to upload and attach to a report.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub payload: ImagePayload,
    pub is_thumbnail: bool,
}

/// Full daily-report submission as received from a client.
#[derive(Debug, Clone)]
pub struct CreateReportRequest {
    pub circle_id: CircleId,
    pub report_id: ReportId,
    pub report_date: chrono::NaiveDate,
    pub dead_units: i64,
    pub bad_units: i64,
    pub note: String,
    pub lines: Vec<LineRequest>,
    pub images: Vec<NewImage>,
}

/// Report revision: the lines are the desired end state, diffed by line id.
/// Existing images are replaced by the ones supplied here.
#[derive(Debug, Clone)]
pub struct ReviseReportRequest {
    pub circle_id: CircleId,
    pub report_id: ReportId,
    pub dead_units: i64,
    pub bad_units: i64,
    pub note: String,
    pub lines: Vec<LineRequest>,
    pub images: Vec<NewImage>,
}

/// Coordinates ledger commands and the remote image store.
pub struct DailyReportService<S, B, I> {
    dispatcher: CommandDispatcher<S, B>,
    images: I,
}

impl<S, B, I> DailyReportService<S, B, I> {
    pub fn new(dispatcher: CommandDispatcher<S, B>, images: I) -> Self {
        Self { dispatcher, images }
    }
}

impl<S, B, I> DailyReportService<S, B, I>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    I: ImageStore,
{
    pub fn start_circle(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        circle_id: CircleId,
        start_date: chrono::NaiveDate,
        total_unit: i64,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatch_with_retry(tenant_id, circle_id, || {
            CircleCommand::StartCircle(StartCircle {
                tenant_id,
                circle_id,
                actor_id,
                start_date,
                total_unit,
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn allocate_stock(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        circle_id: CircleId,
        resource: ResourceRef,
        quantity: i64,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatch_with_retry(tenant_id, circle_id, || {
            CircleCommand::AllocateStock(AllocateStock {
                tenant_id,
                circle_id,
                actor_id,
                resource,
                quantity,
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn close_circle(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        circle_id: CircleId,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatch_with_retry(tenant_id, circle_id, || {
            CircleCommand::CloseCircle(CloseCircle {
                tenant_id,
                circle_id,
                actor_id,
                occurred_at: Utc::now(),
            })
        })
    }

    /// Submit a daily report, then upload and attach its images.
    ///
    /// The returned events are the ledger facts; image failures are logged
    /// and do not surface here.
    pub fn create_report(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        request: CreateReportRequest,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let committed = self.dispatch_with_retry(tenant_id, request.circle_id, || {
            CircleCommand::SubmitDailyReport(SubmitDailyReport {
                tenant_id,
                circle_id: request.circle_id,
                actor_id,
                report_id: request.report_id,
                report_date: request.report_date,
                dead_units: request.dead_units,
                bad_units: request.bad_units,
                note: request.note.clone(),
                lines: request.lines.clone(),
                occurred_at: Utc::now(),
            })
        })?;

        self.attach_images(
            tenant_id,
            actor_id,
            request.circle_id,
            request.report_id,
            &request.images,
        );

        Ok(committed)
    }

    /// Revise a report: reversal + reapply on the ledgers, replacement of the
    /// attachment set.
    pub fn update_report(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        request: ReviseReportRequest,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let committed = self.dispatch_with_retry(tenant_id, request.circle_id, || {
            CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id,
                circle_id: request.circle_id,
                actor_id,
                report_id: request.report_id,
                dead_units: request.dead_units,
                bad_units: request.bad_units,
                note: request.note.clone(),
                lines: request.lines.clone(),
                occurred_at: Utc::now(),
            })
        })?;

        self.delete_links(&cleared_links(&committed));
        self.attach_images(
            tenant_id,
            actor_id,
            request.circle_id,
            request.report_id,
            &request.images,
        );

        Ok(committed)
    }

    /// Retract a report: full ledger reversal, then best-effort cleanup of
    /// its stored images.
    pub fn disable_report(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        circle_id: CircleId,
        report_id: ReportId,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let committed = self.dispatch_with_retry(tenant_id, circle_id, || {
            CircleCommand::RetractDailyReport(RetractDailyReport {
                tenant_id,
                circle_id,
                actor_id,
                report_id,
                occurred_at: Utc::now(),
            })
        })?;

        self.delete_links(&cleared_links(&committed));

        Ok(committed)
    }

    fn dispatch_with_retry(
        &self,
        tenant_id: TenantId,
        circle_id: CircleId,
        make_command: impl Fn() -> CircleCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let mut attempt = 1;
        loop {
            let result = self.dispatcher.dispatch(
                tenant_id,
                circle_id.0,
                AGGREGATE_TYPE,
                make_command(),
                |_, id| LivestockCircle::empty(CircleId::new(id)),
            );

            match result {
                Err(DispatchError::Concurrency(msg)) if attempt < MAX_DISPATCH_ATTEMPTS => {
                    debug!(%circle_id, attempt, conflict = %msg, "retrying after version conflict");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn attach_images(
        &self,
        tenant_id: TenantId,
        actor_id: UserId,
        circle_id: CircleId,
        report_id: ReportId,
        images: &[NewImage],
    ) {
        let folder = format!("daily_reports/{report_id}");

        for image in images {
            let link = match self.images.upload(&folder, &image.payload) {
                Ok(link) => link,
                Err(err) => {
                    warn!(%report_id, error = %err, "image upload failed, skipping attachment");
                    continue;
                }
            };

            let attached = self.dispatch_with_retry(tenant_id, circle_id, || {
                CircleCommand::AttachReportImage(AttachReportImage {
                    tenant_id,
                    circle_id,
                    actor_id,
                    report_id,
                    link: link.clone(),
                    is_thumbnail: image.is_thumbnail,
                    occurred_at: Utc::now(),
                })
            });

            if let Err(err) = attached {
                warn!(%report_id, error = ?err, "image attachment rejected, removing binary");
                if let Err(del) = self.images.delete(&link) {
                    warn!(%link, error = %del, "orphaned image could not be removed");
                }
            }
        }
    }

    fn delete_links(&self, links: &[String]) {
        for link in links {
            if let Err(err) = self.images.delete(link) {
                warn!(%link, error = %err, "stored image could not be removed");
            }
        }
    }
}

/// Image links removed by the committed events, for remote cleanup.
fn cleared_links(committed: &[StoredEvent]) -> Vec<String> {
    let mut links = Vec::new();
    for stored in committed {
        match serde_json::from_value::<CircleEvent>(stored.payload.clone()) {
            Ok(CircleEvent::ReportImagesCleared(e)) => links.extend(e.links),
            Ok(CircleEvent::DailyReportRetracted(e)) => links.extend(e.image_links),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "committed payload did not deserialize"),
        }
    }
    links
}
