//! Guest CPUs

pub mod sh4;

pub use sh4::Sh4Context;
