//! The MCU side of the crate: SPI framing, cross-task state, the sampling
//! task, and the RPMSG-analogue dispatch task (spec.md §4.4).

pub mod sampling;
pub mod spi;
pub mod state;
pub mod task;
