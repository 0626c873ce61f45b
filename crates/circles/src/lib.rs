//! `herdbook-circles` — livestock rearing cycles and their daily reports.
//!
//! A [`LivestockCircle`] is the consistency boundary for one rearing cycle:
//! it owns the live unit counters (good/bad/dead), the per-resource
//! allocated-vs-remaining stock balances, and every daily report submitted
//! against the cycle. Submitting, revising or retracting a report adjusts all
//! three ledgers through a single aggregate event, so a reader never observes
//! a half-applied reconciliation.

pub mod circle;
pub mod report;
pub mod stock;
pub mod units;

pub use circle::{
    AllocateStock, AttachReportImage, CircleCommand, CircleEvent, CircleId, CircleStatus,
    CloseCircle, LineChange, LineRequest, LivestockCircle, RetractDailyReport, ReviseDailyReport,
    StartCircle, SubmitDailyReport,
};
pub use report::{
    ConsumptionLine, DailyReport, ImageAttachment, LineId, ReportId, ReportStatus,
};
pub use stock::{ResourceId, ResourceKind, ResourceRef, StockBalance, StockLedger};
pub use units::{UnitCounts, UnitDelta};
