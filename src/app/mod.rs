//! The application side of the crate: the two-thread device proxy and the
//! supervisory-point adapters built on top of it (spec.md §4.3, §4.5).

pub mod device;
pub mod points;
