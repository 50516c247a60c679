pub mod clock;
pub mod config;
pub mod engine;
pub mod interval;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod schedule;
pub mod wal;
