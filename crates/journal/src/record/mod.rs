pub mod entities;
pub mod interfaces;
pub mod memory;
pub mod sqlite;

pub use interfaces::{
    ApiSettings, JournalStore, ProfileStore, RecordError, SettingsStore, TestRun, TestRunStore,
    Trade, TradeFilter, TradeStore, UserProfile,
};
pub use memory::MemoryJournalStore;
pub use sqlite::SqliteJournalStore;
