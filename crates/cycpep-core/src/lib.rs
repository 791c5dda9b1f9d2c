//! Low-level helpers shared by the CycPep crates.
//!
//! Atomic file replacement for job metadata, epoch clocks for record
//! timestamps, and a poison-tolerant mutex lock.

pub mod atomic_io;
pub mod clock;
pub mod sync_utils;

pub use atomic_io::{is_atomic_temp_file_name, write_text_atomic};
pub use clock::{current_unix_timestamp_ms, current_unix_timestamp_nanos};
pub use sync_utils::lock_unpoisoned;
