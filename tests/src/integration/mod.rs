//! Cross-crate controller scenarios.

pub mod fixtures;

#[cfg(test)]
mod properties;
#[cfg(test)]
mod restart;
