//! Aggregate root: LivestockCircle.
//!
//! The circle is the transaction boundary for daily-report reconciliation.
//! `handle` validates an entire submission (field presence, circle state,
//! date arithmetic, cumulative stock sufficiency, unit-counter guards) before
//! emitting a single fact event; `apply` then performs every ledger mutation
//! at once. Appending that event to the circle's stream is atomic and
//! version-checked, so two writers racing on the same allocation serialize
//! instead of over-debiting.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use herdbook_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId, UserId};
use herdbook_events::{Command, Event};

use crate::report::{
    ConsumptionLine, DailyReport, ImageAttachment, LineId, ReportId, ReportStatus,
};
use crate::stock::{ResourceRef, StockLedger};
use crate::units::{UnitCounts, UnitDelta};

/// Livestock circle identifier (tenant-scoped via `tenant_id` fields in
/// events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircleId(pub AggregateId);

impl CircleId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CircleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Circle lifecycle. Circles are never deleted, only closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircleStatus {
    Growing,
    Closed,
}

/// One requested consumption line (command side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    pub line_id: LineId,
    pub resource: ResourceRef,
    pub quantity: i64,
}

/// Per-line outcome of a report revision: `old_quantity` is credited back,
/// `new_quantity` is debited. A removed line has no new quantity, an added
/// line no old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineChange {
    pub line_id: LineId,
    pub resource: ResourceRef,
    pub old_quantity: Option<i64>,
    pub new_quantity: Option<i64>,
}

/// Aggregate root: LivestockCircle.
#[derive(Debug, Clone, PartialEq)]
pub struct LivestockCircle {
    id: CircleId,
    tenant_id: Option<TenantId>,
    start_date: NaiveDate,
    total_unit: i64,
    units: UnitCounts,
    status: CircleStatus,
    stock: StockLedger,
    reports: HashMap<ReportId, DailyReport>,
    version: u64,
    created: bool,
}

impl LivestockCircle {
    /// Create an empty, not-yet-started aggregate instance for rehydration.
    pub fn empty(id: CircleId) -> Self {
        Self {
            id,
            tenant_id: None,
            start_date: NaiveDate::default(),
            total_unit: 0,
            units: UnitCounts::default(),
            status: CircleStatus::Growing,
            stock: StockLedger::new(),
            reports: HashMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CircleId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn total_unit(&self) -> i64 {
        self.total_unit
    }

    pub fn units(&self) -> &UnitCounts {
        &self.units
    }

    pub fn status(&self) -> CircleStatus {
        self.status
    }

    pub fn stock(&self) -> &StockLedger {
        &self.stock
    }

    pub fn report(&self, report_id: &ReportId) -> Option<&DailyReport> {
        self.reports.get(report_id)
    }

    pub fn is_open(&self) -> bool {
        self.created && self.status == CircleStatus::Growing
    }
}

impl AggregateRoot for LivestockCircle {
    type Id = CircleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartCircle (stocking day of a new rearing cycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCircle {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub start_date: NaiveDate,
    pub total_unit: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AllocateStock (planning workflow sets aside feed/medicine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateStock {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub resource: ResourceRef,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitDailyReport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDailyReport {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub report_date: NaiveDate,
    pub dead_units: i64,
    pub bad_units: i64,
    pub note: String,
    pub lines: Vec<LineRequest>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReviseDailyReport (diff-based reversal + reapply).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseDailyReport {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub dead_units: i64,
    pub bad_units: i64,
    pub note: String,
    pub lines: Vec<LineRequest>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RetractDailyReport (full reversal, logical delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetractDailyReport {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AttachReportImage (metadata row for an uploaded image).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachReportImage {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub link: String,
    pub is_thumbnail: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CloseCircle (cycle sold off or cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseCircle {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleCommand {
    StartCircle(StartCircle),
    AllocateStock(AllocateStock),
    SubmitDailyReport(SubmitDailyReport),
    ReviseDailyReport(ReviseDailyReport),
    RetractDailyReport(RetractDailyReport),
    AttachReportImage(AttachReportImage),
    CloseCircle(CloseCircle),
}

impl Command for CircleCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            CircleCommand::StartCircle(c) => c.circle_id.0,
            CircleCommand::AllocateStock(c) => c.circle_id.0,
            CircleCommand::SubmitDailyReport(c) => c.circle_id.0,
            CircleCommand::ReviseDailyReport(c) => c.circle_id.0,
            CircleCommand::RetractDailyReport(c) => c.circle_id.0,
            CircleCommand::AttachReportImage(c) => c.circle_id.0,
            CircleCommand::CloseCircle(c) => c.circle_id.0,
        }
    }
}

/// Event: CircleStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleStarted {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub start_date: NaiveDate,
    pub total_unit: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockAllocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAllocated {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub resource: ResourceRef,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DailyReportSubmitted. Carries the full reconciliation fact: the
/// unit delta, the derived snapshot fields and every consumption line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyReportSubmitted {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub report_date: NaiveDate,
    pub age_in_days: i64,
    pub dead_units: i64,
    pub bad_units: i64,
    pub good_units: i64,
    pub status: ReportStatus,
    pub note: String,
    pub lines: Vec<LineRequest>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DailyReportRevised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyReportRevised {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub old_delta: UnitDelta,
    pub new_delta: UnitDelta,
    pub good_units: i64,
    pub note: String,
    pub changes: Vec<LineChange>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReportImagesCleared. Lists the removed links so the attachment
/// side-channel can delete the binaries from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportImagesCleared {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub links: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DailyReportRetracted. Credits every active line and reverses the
/// unit counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyReportRetracted {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub delta: UnitDelta,
    pub credits: Vec<LineChange>,
    pub image_links: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReportImageAttached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportImageAttached {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub report_id: ReportId,
    pub link: String,
    pub is_thumbnail: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CircleClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleClosed {
    pub tenant_id: TenantId,
    pub circle_id: CircleId,
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleEvent {
    CircleStarted(CircleStarted),
    StockAllocated(StockAllocated),
    DailyReportSubmitted(DailyReportSubmitted),
    DailyReportRevised(DailyReportRevised),
    ReportImagesCleared(ReportImagesCleared),
    DailyReportRetracted(DailyReportRetracted),
    ReportImageAttached(ReportImageAttached),
    CircleClosed(CircleClosed),
}

impl Event for CircleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircleEvent::CircleStarted(_) => "circle.started",
            CircleEvent::StockAllocated(_) => "circle.stock_allocated",
            CircleEvent::DailyReportSubmitted(_) => "circle.report.submitted",
            CircleEvent::DailyReportRevised(_) => "circle.report.revised",
            CircleEvent::ReportImagesCleared(_) => "circle.report.images_cleared",
            CircleEvent::DailyReportRetracted(_) => "circle.report.retracted",
            CircleEvent::ReportImageAttached(_) => "circle.report.image_attached",
            CircleEvent::CircleClosed(_) => "circle.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CircleEvent::CircleStarted(e) => e.occurred_at,
            CircleEvent::StockAllocated(e) => e.occurred_at,
            CircleEvent::DailyReportSubmitted(e) => e.occurred_at,
            CircleEvent::DailyReportRevised(e) => e.occurred_at,
            CircleEvent::ReportImagesCleared(e) => e.occurred_at,
            CircleEvent::DailyReportRetracted(e) => e.occurred_at,
            CircleEvent::ReportImageAttached(e) => e.occurred_at,
            CircleEvent::CircleClosed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for LivestockCircle {
    type Command = CircleCommand;
    type Event = CircleEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CircleEvent::CircleStarted(e) => {
                self.id = e.circle_id;
                self.tenant_id = Some(e.tenant_id);
                self.start_date = e.start_date;
                self.total_unit = e.total_unit;
                self.units = UnitCounts::stocked(e.total_unit);
                self.status = CircleStatus::Growing;
                self.stock = StockLedger::new();
                self.reports.clear();
                self.created = true;
            }
            CircleEvent::StockAllocated(e) => {
                self.stock.allocate(e.resource, e.quantity);
            }
            CircleEvent::DailyReportSubmitted(e) => {
                let delta = UnitDelta::new(e.dead_units, e.bad_units);
                self.units.apply_delta(&delta);
                for line in &e.lines {
                    self.stock.debit(&line.resource, line.quantity);
                }
                self.reports.insert(
                    e.report_id,
                    DailyReport {
                        id: e.report_id,
                        report_date: e.report_date,
                        age_in_days: e.age_in_days,
                        dead_units: e.dead_units,
                        bad_units: e.bad_units,
                        good_units: e.good_units,
                        status: e.status,
                        note: e.note.clone(),
                        is_active: true,
                        lines: e
                            .lines
                            .iter()
                            .map(|l| ConsumptionLine {
                                line_id: l.line_id,
                                resource: l.resource,
                                quantity: l.quantity,
                                is_active: true,
                            })
                            .collect(),
                        images: Vec::new(),
                    },
                );
            }
            CircleEvent::DailyReportRevised(e) => {
                self.units.reverse_delta(&e.old_delta);
                self.units.apply_delta(&e.new_delta);
                // All old-line credits land before any new debit, matching the
                // projected balance the decision was checked against; remaining
                // never dips below zero mid-replay.
                for change in &e.changes {
                    if let Some(old) = change.old_quantity {
                        self.stock.credit(&change.resource, old);
                    }
                }
                for change in &e.changes {
                    if let Some(new) = change.new_quantity {
                        self.stock.debit(&change.resource, new);
                    }
                }
                if let Some(report) = self.reports.get_mut(&e.report_id) {
                    report.dead_units = e.new_delta.dead;
                    report.bad_units = e.new_delta.bad;
                    report.good_units = e.good_units;
                    report.note = e.note.clone();
                    for change in &e.changes {
                        match (change.old_quantity, change.new_quantity) {
                            (Some(_), Some(new)) => {
                                if let Some(line) = report.line_mut(&change.line_id) {
                                    line.quantity = new;
                                }
                            }
                            (Some(_), None) => {
                                if let Some(line) = report.line_mut(&change.line_id) {
                                    line.is_active = false;
                                }
                            }
                            (None, Some(new)) => {
                                report.lines.push(ConsumptionLine {
                                    line_id: change.line_id,
                                    resource: change.resource,
                                    quantity: new,
                                    is_active: true,
                                });
                            }
                            (None, None) => {}
                        }
                    }
                }
            }
            CircleEvent::ReportImagesCleared(e) => {
                if let Some(report) = self.reports.get_mut(&e.report_id) {
                    for image in report.images.iter_mut() {
                        image.is_active = false;
                    }
                }
            }
            CircleEvent::DailyReportRetracted(e) => {
                self.units.reverse_delta(&e.delta);
                for credit in &e.credits {
                    if let Some(old) = credit.old_quantity {
                        self.stock.credit(&credit.resource, old);
                    }
                }
                if let Some(report) = self.reports.get_mut(&e.report_id) {
                    for line in report.lines.iter_mut() {
                        line.is_active = false;
                    }
                    for image in report.images.iter_mut() {
                        image.is_active = false;
                    }
                    report.is_active = false;
                }
            }
            CircleEvent::ReportImageAttached(e) => {
                if let Some(report) = self.reports.get_mut(&e.report_id) {
                    report.images.push(ImageAttachment {
                        link: e.link.clone(),
                        is_thumbnail: e.is_thumbnail,
                        is_active: true,
                    });
                }
            }
            CircleEvent::CircleClosed(_) => {
                self.status = CircleStatus::Closed;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CircleCommand::StartCircle(cmd) => self.handle_start(cmd),
            CircleCommand::AllocateStock(cmd) => self.handle_allocate(cmd),
            CircleCommand::SubmitDailyReport(cmd) => self.handle_submit(cmd),
            CircleCommand::ReviseDailyReport(cmd) => self.handle_revise(cmd),
            CircleCommand::RetractDailyReport(cmd) => self.handle_retract(cmd),
            CircleCommand::AttachReportImage(cmd) => self.handle_attach_image(cmd),
            CircleCommand::CloseCircle(cmd) => self.handle_close(cmd),
        }
    }
}

impl LivestockCircle {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invalid_state("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_circle_id(&self, circle_id: CircleId) -> Result<(), DomainError> {
        if self.id != circle_id {
            return Err(DomainError::invalid_state("circle_id mismatch"));
        }
        Ok(())
    }

    /// Collect every violated field of a report payload into one error.
    fn validate_report_payload(
        dead_units: i64,
        bad_units: i64,
        lines: &[LineRequest],
    ) -> Result<(), DomainError> {
        let mut violations: Vec<String> = Vec::new();

        if dead_units < 0 {
            violations.push("dead_units must not be negative".to_string());
        }
        if bad_units < 0 {
            violations.push("bad_units must not be negative".to_string());
        }
        for (idx, line) in lines.iter().enumerate() {
            if line.quantity <= 0 {
                violations.push(format!("lines[{idx}].quantity must be positive"));
            }
            if lines[..idx].iter().any(|l| l.line_id == line.line_id) {
                violations.push(format!("lines[{idx}].line_id duplicates an earlier line"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(DomainError::validation(violations.join(", ")))
        }
    }

    fn handle_start(&self, cmd: &StartCircle) -> Result<Vec<CircleEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("circle already exists"));
        }
        if cmd.total_unit <= 0 {
            return Err(DomainError::validation("total_unit must be positive"));
        }

        Ok(vec![CircleEvent::CircleStarted(CircleStarted {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            start_date: cmd.start_date,
            total_unit: cmd.total_unit,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_allocate(&self, cmd: &AllocateStock) -> Result<Vec<CircleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.status != CircleStatus::Growing {
            return Err(DomainError::invalid_state("circle is closed"));
        }

        Ok(vec![CircleEvent::StockAllocated(StockAllocated {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            resource: cmd.resource,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &SubmitDailyReport) -> Result<Vec<CircleEvent>, DomainError> {
        Self::validate_report_payload(cmd.dead_units, cmd.bad_units, &cmd.lines)?;

        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        if self.status != CircleStatus::Growing {
            return Err(DomainError::invalid_state("circle is closed"));
        }
        if self.reports.contains_key(&cmd.report_id) {
            return Err(DomainError::conflict("report already exists"));
        }

        let age_in_days = (cmd.report_date - self.start_date).num_days();
        if age_in_days < 0 {
            return Err(DomainError::invalid_state(format!(
                "invalid start date: circle starts {} but report is dated {}",
                self.start_date, cmd.report_date
            )));
        }

        let delta = UnitDelta::new(cmd.dead_units, cmd.bad_units);
        self.units.check_apply(&delta)?;
        let good_units = self.units.good - delta.total();

        // Cumulative sufficiency per resource: a request may consume the same
        // allocation through several lines.
        let mut requested: HashMap<ResourceRef, i64> = HashMap::new();
        for line in &cmd.lines {
            *requested.entry(line.resource).or_insert(0) += line.quantity;
        }
        for (resource, total) in &requested {
            self.stock.check_debit(resource, *total)?;
        }

        let status = if cmd.report_date == cmd.occurred_at.date_naive() {
            ReportStatus::Today
        } else {
            ReportStatus::Historical
        };

        Ok(vec![CircleEvent::DailyReportSubmitted(DailyReportSubmitted {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            report_id: cmd.report_id,
            report_date: cmd.report_date,
            age_in_days,
            dead_units: cmd.dead_units,
            bad_units: cmd.bad_units,
            good_units,
            status,
            note: cmd.note.clone(),
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revise(&self, cmd: &ReviseDailyReport) -> Result<Vec<CircleEvent>, DomainError> {
        Self::validate_report_payload(cmd.dead_units, cmd.bad_units, &cmd.lines)?;

        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        let report = self
            .reports
            .get(&cmd.report_id)
            .filter(|r| r.is_active)
            .ok_or(DomainError::NotFound)?;

        // Reversal then reapply on the unit counters, checked on a scratch copy.
        let old_delta = UnitDelta::new(report.dead_units, report.bad_units);
        let new_delta = UnitDelta::new(cmd.dead_units, cmd.bad_units);
        let mut counts = self.units;
        counts.check_reverse(&old_delta)?;
        counts.reverse_delta(&old_delta);
        counts.check_apply(&new_delta)?;
        let good_units = counts.good - new_delta.total();

        let changes = self.diff_lines(report, &cmd.lines)?;

        // All old-line credits are applied before any new debit is checked, so
        // the whole revision either fits or is rejected as a unit.
        let mut projected: HashMap<ResourceRef, i64> = HashMap::new();
        for change in &changes {
            if let Some(old) = change.old_quantity {
                let base = self
                    .stock
                    .remaining(&change.resource)
                    .ok_or(DomainError::NotFound)?;
                *projected.entry(change.resource).or_insert(base) += old;
            }
        }
        for change in &changes {
            if let Some(new) = change.new_quantity {
                let base = match projected.get(&change.resource) {
                    Some(available) => *available,
                    None => self
                        .stock
                        .remaining(&change.resource)
                        .ok_or(DomainError::NotFound)?,
                };
                if new > base {
                    return Err(DomainError::insufficient_stock(format!(
                        "{}: requested {new}, available {base}",
                        change.resource
                    )));
                }
                projected.insert(change.resource, base - new);
            }
        }

        let mut events = vec![CircleEvent::DailyReportRevised(DailyReportRevised {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            report_id: cmd.report_id,
            old_delta,
            new_delta,
            good_units,
            note: cmd.note.clone(),
            changes,
            occurred_at: cmd.occurred_at,
        })];

        // A revision replaces the attachment set; the cleared links let the
        // side-channel delete the binaries.
        let links = report.active_image_links();
        if !links.is_empty() {
            events.push(CircleEvent::ReportImagesCleared(ReportImagesCleared {
                tenant_id: cmd.tenant_id,
                circle_id: cmd.circle_id,
                actor_id: cmd.actor_id,
                report_id: cmd.report_id,
                links,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    /// Diff the requested lines against the report's active lines by line id.
    fn diff_lines(
        &self,
        report: &DailyReport,
        requested: &[LineRequest],
    ) -> Result<Vec<LineChange>, DomainError> {
        let mut changes: Vec<LineChange> = Vec::new();

        for line in report.active_lines() {
            match requested.iter().find(|r| r.line_id == line.line_id) {
                Some(new) => {
                    if new.resource != line.resource {
                        return Err(DomainError::validation(format!(
                            "line {} cannot change resource; remove it and add a new line",
                            line.line_id
                        )));
                    }
                    changes.push(LineChange {
                        line_id: line.line_id,
                        resource: line.resource,
                        old_quantity: Some(line.quantity),
                        new_quantity: Some(new.quantity),
                    });
                }
                None => changes.push(LineChange {
                    line_id: line.line_id,
                    resource: line.resource,
                    old_quantity: Some(line.quantity),
                    new_quantity: None,
                }),
            }
        }

        for new in requested {
            let existing = report.line(&new.line_id);
            if existing.is_some_and(|l| l.is_active) {
                continue; // matched above
            }
            if existing.is_some() {
                return Err(DomainError::validation(format!(
                    "line {} was already used by a removed line",
                    new.line_id
                )));
            }
            changes.push(LineChange {
                line_id: new.line_id,
                resource: new.resource,
                old_quantity: None,
                new_quantity: Some(new.quantity),
            });
        }

        Ok(changes)
    }

    fn handle_retract(&self, cmd: &RetractDailyReport) -> Result<Vec<CircleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        // An already-retracted report is NotFound: retraction never
        // double-credits an allocation.
        let report = self
            .reports
            .get(&cmd.report_id)
            .filter(|r| r.is_active)
            .ok_or(DomainError::NotFound)?;

        let delta = UnitDelta::new(report.dead_units, report.bad_units);
        self.units.check_reverse(&delta)?;

        let credits = report
            .active_lines()
            .map(|line| LineChange {
                line_id: line.line_id,
                resource: line.resource,
                old_quantity: Some(line.quantity),
                new_quantity: None,
            })
            .collect();

        Ok(vec![CircleEvent::DailyReportRetracted(DailyReportRetracted {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            report_id: cmd.report_id,
            delta,
            credits,
            image_links: report.active_image_links(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_attach_image(
        &self,
        cmd: &AttachReportImage,
    ) -> Result<Vec<CircleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        if cmd.link.trim().is_empty() {
            return Err(DomainError::validation("link must not be empty"));
        }

        // A single active thumbnail is a soft convention; a second one is
        // accepted rather than rejected.
        if self
            .reports
            .get(&cmd.report_id)
            .filter(|r| r.is_active)
            .is_none()
        {
            return Err(DomainError::not_found());
        }

        Ok(vec![CircleEvent::ReportImageAttached(ReportImageAttached {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            report_id: cmd.report_id,
            link: cmd.link.clone(),
            is_thumbnail: cmd.is_thumbnail,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, cmd: &CloseCircle) -> Result<Vec<CircleEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_circle_id(cmd.circle_id)?;

        if self.status != CircleStatus::Growing {
            return Err(DomainError::invalid_state("circle already closed"));
        }

        Ok(vec![CircleEvent::CircleClosed(CircleClosed {
            tenant_id: cmd.tenant_id,
            circle_id: cmd.circle_id,
            actor_id: cmd.actor_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::{ResourceId, ResourceKind};
    use herdbook_events::execute;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_circle_id() -> CircleId {
        CircleId::new(AggregateId::new())
    }

    fn test_actor() -> UserId {
        UserId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn start_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    struct Fixture {
        circle: LivestockCircle,
        tenant_id: TenantId,
        circle_id: CircleId,
        actor_id: UserId,
        feed: ResourceRef,
        vaccine: ResourceRef,
    }

    /// A started circle with 100 units, 50 feed and 20 vaccine allocated.
    fn fixture() -> Fixture {
        let tenant_id = test_tenant_id();
        let circle_id = test_circle_id();
        let actor_id = test_actor();
        let feed = ResourceRef::food(ResourceId::new());
        let vaccine = ResourceRef::medicine(ResourceId::new());

        let mut circle = LivestockCircle::empty(circle_id);
        execute(
            &mut circle,
            &CircleCommand::StartCircle(StartCircle {
                tenant_id,
                circle_id,
                actor_id,
                start_date: start_date(),
                total_unit: 100,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        for (resource, quantity) in [(feed, 50), (vaccine, 20)] {
            execute(
                &mut circle,
                &CircleCommand::AllocateStock(AllocateStock {
                    tenant_id,
                    circle_id,
                    actor_id,
                    resource,
                    quantity,
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
        }

        Fixture {
            circle,
            tenant_id,
            circle_id,
            actor_id,
            feed,
            vaccine,
        }
    }

    fn submit_cmd(f: &Fixture, report_id: ReportId, lines: Vec<LineRequest>) -> CircleCommand {
        CircleCommand::SubmitDailyReport(SubmitDailyReport {
            tenant_id: f.tenant_id,
            circle_id: f.circle_id,
            actor_id: f.actor_id,
            report_id,
            report_date: start_date() + chrono::Days::new(7),
            dead_units: 3,
            bad_units: 2,
            note: "routine".to_string(),
            lines,
            occurred_at: test_time(),
        })
    }

    fn feed_line(f: &Fixture, quantity: i64) -> LineRequest {
        LineRequest {
            line_id: LineId::new(),
            resource: f.feed,
            quantity,
        }
    }

    fn submit(f: &mut Fixture, report_id: ReportId, lines: Vec<LineRequest>) {
        let cmd = submit_cmd(f, report_id, lines);
        execute(&mut f.circle, &cmd).unwrap();
    }

    #[test]
    fn submit_debits_allocations_and_updates_counters() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let line = feed_line(&f, 10);

        submit(&mut f, report_id, vec![line]);

        assert_eq!(f.circle.stock().remaining(&f.feed), Some(40));
        assert_eq!(f.circle.units().dead, 3);
        assert_eq!(f.circle.units().bad, 2);
        assert_eq!(f.circle.units().good, 95);

        let report = f.circle.report(&report_id).unwrap();
        assert_eq!(report.age_in_days, 7);
        assert_eq!(report.good_units, 95);
        assert!(report.is_active);
        assert_eq!(report.food_lines().count(), 1);
    }

    #[test]
    fn submit_validation_lists_every_violated_field() {
        let f = fixture();
        let cmd = CircleCommand::SubmitDailyReport(SubmitDailyReport {
            tenant_id: f.tenant_id,
            circle_id: f.circle_id,
            actor_id: f.actor_id,
            report_id: ReportId::new(),
            report_date: start_date(),
            dead_units: -1,
            bad_units: -4,
            note: String::new(),
            lines: vec![LineRequest {
                line_id: LineId::new(),
                resource: f.feed,
                quantity: 0,
            }],
            occurred_at: test_time(),
        });

        match f.circle.handle(&cmd).unwrap_err() {
            DomainError::Validation(msg) => {
                assert!(msg.contains("dead_units"));
                assert!(msg.contains("bad_units"));
                assert!(msg.contains("lines[0].quantity"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn submit_against_unknown_allocation_is_not_found() {
        let f = fixture();
        let stray = ResourceRef::medicine(ResourceId::new());
        let cmd = submit_cmd(
            &f,
            ReportId::new(),
            vec![LineRequest {
                line_id: LineId::new(),
                resource: stray,
                quantity: 1,
            }],
        );

        assert_eq!(f.circle.handle(&cmd).unwrap_err(), DomainError::NotFound);
    }

    #[test]
    fn submit_at_exact_remaining_succeeds_and_one_more_fails() {
        let mut f = fixture();
        let cmd = submit_cmd(&f, ReportId::new(), vec![feed_line(&f, 50)]);
        execute(&mut f.circle, &cmd).unwrap();
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(0));

        let over = submit_cmd(&f, ReportId::new(), vec![feed_line(&f, 1)]);
        let err = f.circle.handle(&over).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(0));
    }

    #[test]
    fn submit_checks_cumulative_quantity_across_lines() {
        let f = fixture();
        // Two lines of 30 against 50 remaining: each fits alone, not together.
        let cmd = submit_cmd(
            &f,
            ReportId::new(),
            vec![feed_line(&f, 30), feed_line(&f, 30)],
        );

        let err = f.circle.handle(&cmd).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
    }

    #[test]
    fn submit_before_start_date_is_invalid_state() {
        let f = fixture();
        let cmd = CircleCommand::SubmitDailyReport(SubmitDailyReport {
            tenant_id: f.tenant_id,
            circle_id: f.circle_id,
            actor_id: f.actor_id,
            report_id: ReportId::new(),
            report_date: start_date() - chrono::Days::new(1),
            dead_units: 0,
            bad_units: 0,
            note: String::new(),
            lines: vec![],
            occurred_at: test_time(),
        });

        match f.circle.handle(&cmd).unwrap_err() {
            DomainError::InvalidState(msg) => assert!(msg.contains("invalid start date")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn submit_duplicate_report_id_conflicts() {
        let mut f = fixture();
        let report_id = ReportId::new();
        submit(&mut f, report_id, vec![]);

        let err = f.circle.handle(&submit_cmd(&f, report_id, vec![])).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn revise_reapplies_counters_instead_of_summing() {
        let mut f = fixture();
        let report_id = ReportId::new();
        submit(&mut f, report_id, vec![]);
        assert_eq!(f.circle.units().dead, 3);

        execute(
            &mut f.circle,
            &CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 5,
                bad_units: 1,
                note: "corrected".to_string(),
                lines: vec![],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        // New values, not old + new.
        assert_eq!(f.circle.units().dead, 5);
        assert_eq!(f.circle.units().bad, 1);
        assert_eq!(f.circle.units().good, 94);

        let report = f.circle.report(&report_id).unwrap();
        assert_eq!(report.dead_units, 5);
        assert_eq!(report.note, "corrected");
    }

    #[test]
    fn revise_diffs_lines_by_id() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let kept = feed_line(&f, 10);
        let removed = LineRequest {
            line_id: LineId::new(),
            resource: f.vaccine,
            quantity: 5,
        };
        let cmd = submit_cmd(&f, report_id, vec![kept.clone(), removed.clone()]);
        execute(&mut f.circle, &cmd).unwrap();
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(40));
        assert_eq!(f.circle.stock().remaining(&f.vaccine), Some(15));

        let added = LineRequest {
            line_id: LineId::new(),
            resource: f.vaccine,
            quantity: 2,
        };
        execute(
            &mut f.circle,
            &CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![
                    LineRequest {
                        quantity: 4,
                        ..kept.clone()
                    },
                    added.clone(),
                ],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        // Kept line: 10 credited, 4 debited. Removed line: 5 credited.
        // Added line: 2 debited.
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(46));
        assert_eq!(f.circle.stock().remaining(&f.vaccine), Some(18));

        let report = f.circle.report(&report_id).unwrap();
        assert_eq!(report.line(&kept.line_id).unwrap().quantity, 4);
        assert!(!report.line(&removed.line_id).unwrap().is_active);
        assert!(report.line(&added.line_id).unwrap().is_active);
    }

    #[test]
    fn revise_checks_sufficiency_after_crediting_old_lines() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let line = feed_line(&f, 48);
        submit(&mut f, report_id, vec![line.clone()]);
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(2));

        // 48 credited back + 2 remaining = 50 available: a 50 debit fits.
        execute(
            &mut f.circle,
            &CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![LineRequest {
                    quantity: 50,
                    ..line.clone()
                }],
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(0));

        // 51 does not.
        let err = f
            .circle
            .handle(&CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![LineRequest {
                    quantity: 51,
                    ..line
                }],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
    }

    #[test]
    fn revise_replay_never_drives_remaining_negative() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let grown = feed_line(&f, 10);
        let removed = feed_line(&f, 30);
        let lines = vec![grown.clone(), removed];
        submit(&mut f, report_id, lines);
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(10));

        // The grown line's new debit (35) exceeds remaining plus its own old
        // quantity; only the removed line's credit covers it. The replay must
        // land every credit before any debit or the ledger bound breaks
        // mid-apply.
        execute(
            &mut f.circle,
            &CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![LineRequest {
                    quantity: 35,
                    ..grown
                }],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(f.circle.stock().remaining(&f.feed), Some(15));
        assert_eq!(f.circle.stock().balance(&f.feed).unwrap().allocated, 50);
    }

    #[test]
    fn revise_of_retracted_report_is_not_found() {
        let mut f = fixture();
        let report_id = ReportId::new();
        submit(&mut f, report_id, vec![]);
        execute(
            &mut f.circle,
            &CircleCommand::RetractDailyReport(RetractDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let err = f
            .circle
            .handle(&CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 0,
                bad_units: 0,
                note: String::new(),
                lines: vec![],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn retract_restores_allocations_and_counters() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let lines = vec![feed_line(&f, 10)];
        submit(&mut f, report_id, lines);
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(40));

        execute(
            &mut f.circle,
            &CircleCommand::RetractDailyReport(RetractDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(f.circle.stock().remaining(&f.feed), Some(50));
        assert_eq!(*f.circle.units(), UnitCounts::stocked(100));

        let report = f.circle.report(&report_id).unwrap();
        assert!(!report.is_active);
        assert!(report.active_lines().next().is_none());
    }

    #[test]
    fn retract_twice_does_not_double_credit() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let lines = vec![feed_line(&f, 10)];
        submit(&mut f, report_id, lines);

        let retract = CircleCommand::RetractDailyReport(RetractDailyReport {
            tenant_id: f.tenant_id,
            circle_id: f.circle_id,
            actor_id: f.actor_id,
            report_id,
            occurred_at: test_time(),
        });
        execute(&mut f.circle, &retract).unwrap();
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(50));

        assert_eq!(f.circle.handle(&retract).unwrap_err(), DomainError::NotFound);
        assert_eq!(f.circle.stock().remaining(&f.feed), Some(50));
    }

    #[test]
    fn attach_image_records_metadata_row() {
        let mut f = fixture();
        let report_id = ReportId::new();
        submit(&mut f, report_id, vec![]);

        execute(
            &mut f.circle,
            &CircleCommand::AttachReportImage(AttachReportImage {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                link: "https://img.test/reports/1.jpg".to_string(),
                is_thumbnail: true,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let report = f.circle.report(&report_id).unwrap();
        assert_eq!(report.thumbnail().unwrap().link, "https://img.test/reports/1.jpg");
    }

    #[test]
    fn revise_clears_active_images_and_lists_links() {
        let mut f = fixture();
        let report_id = ReportId::new();
        submit(&mut f, report_id, vec![]);
        execute(
            &mut f.circle,
            &CircleCommand::AttachReportImage(AttachReportImage {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                link: "https://img.test/reports/old.jpg".to_string(),
                is_thumbnail: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let events = execute(
            &mut f.circle,
            &CircleCommand::ReviseDailyReport(ReviseDailyReport {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                report_id,
                dead_units: 3,
                bad_units: 2,
                note: String::new(),
                lines: vec![],
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let cleared = events
            .iter()
            .find_map(|e| match e {
                CircleEvent::ReportImagesCleared(c) => Some(c),
                _ => None,
            })
            .expect("images cleared event");
        assert_eq!(cleared.links, vec!["https://img.test/reports/old.jpg".to_string()]);
        assert!(f.circle.report(&report_id).unwrap().active_image_links().is_empty());
    }

    #[test]
    fn submit_on_closed_circle_is_invalid_state() {
        let mut f = fixture();
        execute(
            &mut f.circle,
            &CircleCommand::CloseCircle(CloseCircle {
                tenant_id: f.tenant_id,
                circle_id: f.circle_id,
                actor_id: f.actor_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let err = f
            .circle
            .handle(&submit_cmd(&f, ReportId::new(), vec![]))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn line_kind_is_preserved_on_the_stored_report() {
        let mut f = fixture();
        let report_id = ReportId::new();
        let lines = vec![
            feed_line(&f, 5),
            LineRequest {
                line_id: LineId::new(),
                resource: f.vaccine,
                quantity: 1,
            },
        ];
        submit(&mut f, report_id, lines);

        let report = f.circle.report(&report_id).unwrap();
        assert_eq!(report.food_lines().count(), 1);
        assert_eq!(report.medicine_lines().count(), 1);
        assert!(report
            .medicine_lines()
            .all(|l| l.resource.kind == ResourceKind::Medicine));
    }
}
