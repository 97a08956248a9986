pub mod deficit;
pub mod error;
pub mod models;
pub mod partition;
pub mod window;
