pub mod file;

pub use file::{load_fork_database, save_fork_database};
