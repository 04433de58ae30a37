pub mod database;
pub mod errors;
pub mod session;
pub mod table;
pub mod undo;

pub use database::{Database, DatabaseLimits};
pub use errors::StateError;
pub use session::{MaybeSession, Session};
pub use table::StateObject;
