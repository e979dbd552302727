//! Process lifecycle helpers.

pub mod shutdown;
pub mod sweeper;
