pub mod outbound;

pub use outbound::{next_block_num, LogStore};
