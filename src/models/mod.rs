//! Domain model module declarations.

pub mod classification;
pub mod process;
pub mod restart;
pub mod termination;
pub mod throttle;
