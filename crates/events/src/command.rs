use herdbook_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent** — a request to perform an action on an
/// aggregate. They are transient (not persisted) and are transformed into
/// events (which are persisted).
///
/// - **Command**: intent ("submit today's report for circle X")
/// - **Event**: accepted fact ("DailyReportSubmitted { ... }")
///
/// Commands are rejected if invalid; events represent accepted changes.
///
/// Each command names its target via `target_aggregate_id()`, which lets
/// infrastructure route it to the right stream and keeps every command inside
/// a single-aggregate transaction boundary. Tenant context is attached by the
/// infrastructure layer when events are persisted, so commands stay focused on
/// business intent.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
