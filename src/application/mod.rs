pub mod bootstrap;
pub mod pacing;
pub mod scheduler;
pub mod status;
