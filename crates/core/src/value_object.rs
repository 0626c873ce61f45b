//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**; identity does
/// not matter. A unit-count delta `{ dead: 3, bad: 1 }` is a value object,
/// while a daily report with a `ReportId` is an entity.
///
/// To "modify" a value object, create a new one with the new values. This
/// keeps them safe to share across threads and gives them value semantics.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
