pub mod entry;
pub mod errors;

pub use entry::LogEntry;
pub use errors::BlockLogError;
