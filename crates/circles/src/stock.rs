//! Stock ledger: allocated-vs-remaining balances for a circle's consumables.
//!
//! One balance per (resource kind, resource id) pair, created by the planning
//! workflow via `AllocateStock`. Debits happen when a daily report consumes
//! the resource; credits happen when a report is revised or retracted.
//!
//! Invariant: `0 <= remaining <= allocated`. Sufficiency is checked in the
//! aggregate's command handler before any event is emitted, so the mutation
//! methods here are infallible.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herdbook_core::{DomainError, DomainResult, ValueObject};

/// Consumable resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Food,
    Medicine,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Food => "food",
            ResourceKind::Medicine => "medicine",
        }
    }
}

/// Identifier of a feed or medicine catalog item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Reference to one catalog resource of a given kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn food(id: ResourceId) -> Self {
        Self {
            kind: ResourceKind::Food,
            id,
        }
    }

    pub fn medicine(id: ResourceId) -> Self {
        Self {
            kind: ResourceKind::Medicine,
            id,
        }
    }
}

impl core::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.id)
    }
}

impl ValueObject for ResourceRef {}

/// Allocated-vs-remaining balance for one (circle, resource) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub allocated: i64,
    pub remaining: i64,
}

impl StockBalance {
    pub fn consumed(&self) -> i64 {
        self.allocated - self.remaining
    }
}

impl ValueObject for StockBalance {}

/// All stock balances held by one circle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedger {
    balances: HashMap<ResourceRef, StockBalance>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, resource: &ResourceRef) -> Option<&StockBalance> {
        self.balances.get(resource)
    }

    pub fn remaining(&self, resource: &ResourceRef) -> Option<i64> {
        self.balances.get(resource).map(|b| b.remaining)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceRef, &StockBalance)> {
        self.balances.iter()
    }

    /// Check that `quantity` can be debited from `resource`.
    ///
    /// Fails with `NotFound` when the circle holds no allocation for the
    /// resource, and with `InsufficientStock` (naming the resource) when the
    /// remaining balance cannot cover the request.
    pub fn check_debit(&self, resource: &ResourceRef, quantity: i64) -> DomainResult<()> {
        let balance = self
            .balances
            .get(resource)
            .ok_or(DomainError::NotFound)?;

        if quantity > balance.remaining {
            return Err(DomainError::insufficient_stock(format!(
                "{resource}: requested {quantity}, remaining {}",
                balance.remaining
            )));
        }

        Ok(())
    }

    /// Raise both `allocated` and `remaining` (planning workflow top-up).
    pub fn allocate(&mut self, resource: ResourceRef, quantity: i64) {
        let balance = self
            .balances
            .entry(resource)
            .or_insert(StockBalance {
                allocated: 0,
                remaining: 0,
            });
        balance.allocated += quantity;
        balance.remaining += quantity;
    }

    /// Consume `quantity` from `resource`. Caller has already run `check_debit`.
    pub fn debit(&mut self, resource: &ResourceRef, quantity: i64) {
        if let Some(balance) = self.balances.get_mut(resource) {
            balance.remaining -= quantity;
            debug_assert!(
                balance.remaining >= 0,
                "remaining went negative for {resource}"
            );
        }
    }

    /// Return `quantity` to `resource` (revision or retraction reversal).
    ///
    /// Only amounts previously debited by still-active lines are ever
    /// credited back, so `remaining` cannot climb above `allocated` through
    /// report reversal.
    pub fn credit(&mut self, resource: &ResourceRef, quantity: i64) {
        if let Some(balance) = self.balances.get_mut(resource) {
            balance.remaining += quantity;
            debug_assert!(
                balance.remaining <= balance.allocated,
                "remaining exceeded allocated for {resource}"
            );
        }
    }
}
