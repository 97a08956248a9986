pub mod activity_store;
pub mod config;
pub mod error;
pub mod run_journal;
pub mod run_state_repository;
pub mod storage;
