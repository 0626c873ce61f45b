//! Event-driven projections feeding the read models.

pub mod circle_stock;

pub use circle_stock::{CircleStockProjection, CircleSummary, StockRow};
