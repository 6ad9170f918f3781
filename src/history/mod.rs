// src/history/mod.rs

pub mod price;
pub mod table_history;

pub use price::PriceRow;
pub use table_history::{HistoryRow, TableHistory};

pub type PriceHistory = TableHistory<PriceRow>;
