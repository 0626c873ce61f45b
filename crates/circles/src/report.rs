//! Daily report entity: one dated submission for a circle, with its
//! consumption lines and image attachment rows.
//!
//! Reports are never hard-deleted. Retraction flips `is_active` on the report
//! and its lines so the ledger reversal history stays reproducible.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herdbook_core::Entity;

use crate::stock::ResourceRef;

/// Daily report identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ReportId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Consumption line identifier (stable across report revisions).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(pub Uuid);

impl LineId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Whether the report covers the submission day or an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Today,
    Historical,
}

/// Consumption of one resource by one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionLine {
    pub line_id: LineId,
    pub resource: ResourceRef,
    pub quantity: i64,
    pub is_active: bool,
}

/// Image attachment row. Binary content lives in the image store; only the
/// link and metadata are recorded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub link: String,
    pub is_thumbnail: bool,
    pub is_active: bool,
}

/// One dated submission recording consumption and mortality for a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyReport {
    pub id: ReportId,
    pub report_date: NaiveDate,
    /// Days since the circle's start date, at report time.
    pub age_in_days: i64,
    pub dead_units: i64,
    pub bad_units: i64,
    /// Snapshot of the surviving good count at report time.
    pub good_units: i64,
    pub status: ReportStatus,
    pub note: String,
    pub is_active: bool,
    pub lines: Vec<ConsumptionLine>,
    pub images: Vec<ImageAttachment>,
}

impl Entity for DailyReport {
    type Id = ReportId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl DailyReport {
    pub fn active_lines(&self) -> impl Iterator<Item = &ConsumptionLine> {
        self.lines.iter().filter(|l| l.is_active)
    }

    pub fn food_lines(&self) -> impl Iterator<Item = &ConsumptionLine> {
        self.lines
            .iter()
            .filter(|l| l.resource.kind == crate::stock::ResourceKind::Food)
    }

    pub fn medicine_lines(&self) -> impl Iterator<Item = &ConsumptionLine> {
        self.lines
            .iter()
            .filter(|l| l.resource.kind == crate::stock::ResourceKind::Medicine)
    }

    pub fn line(&self, line_id: &LineId) -> Option<&ConsumptionLine> {
        self.lines.iter().find(|l| l.line_id == *line_id)
    }

    pub fn line_mut(&mut self, line_id: &LineId) -> Option<&mut ConsumptionLine> {
        self.lines.iter_mut().find(|l| l.line_id == *line_id)
    }

    /// At most one active thumbnail per report is a soft convention; this
    /// returns the first if several exist.
    pub fn thumbnail(&self) -> Option<&ImageAttachment> {
        self.images.iter().find(|i| i.is_active && i.is_thumbnail)
    }

    pub fn active_image_links(&self) -> Vec<String> {
        self.images
            .iter()
            .filter(|i| i.is_active)
            .map(|i| i.link.clone())
            .collect()
    }
}
