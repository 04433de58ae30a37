//! Ports (hexagonal boundaries) of the chain controller.

pub mod outbound;

pub use outbound::*;
