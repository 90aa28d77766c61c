//! Utility modules
//!
//! This module contains common utilities used across the codebase.

pub mod cleanup;
pub mod stamp;

pub use cleanup::{delete_files, run_periodic_cleanup};
pub use stamp::{stamp_file_name, MonotonicStamp};
