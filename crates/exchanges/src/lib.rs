pub mod bybit;

// Convenience re-exports
pub use bybit::{
    BybitClient, BybitClosedPnl, BybitExecution, BybitPosition, ClosedPnlPage, ExecutionPage,
};
