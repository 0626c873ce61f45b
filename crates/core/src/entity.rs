//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Entities owned by an aggregate (a daily report, a consumption line) keep
/// their identity across mutation and logical deletion; they are never
/// hard-deleted, because historical ledger reversal must stay reproducible.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
