//! Domain model, configuration and storage for the auto-claude task board.
//!
//! - [`types`]: tasks, lifecycle statuses and the events a store reports.
//! - [`task_store`]: the task persistence contract with synchronous observers.
//! - [`config`] / [`settings`]: TOML configuration and live project settings.
//! - [`file_watcher`]: `notify`-backed watcher for transcript directories.

pub mod config;
pub mod file_watcher;
pub mod settings;
pub mod task_store;
pub mod types;
