use std::sync::atomic::{AtomicU64, Ordering};

use cycpep_core::current_unix_timestamp_nanos;
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest; short enough to type, long enough to stay unique.
pub const JOB_ID_HEX_CHARS: usize = 12;

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a fresh opaque job id.
///
/// The id hashes the process id, the wall clock in nanoseconds and a
/// process-wide counter, so two calls in one process never hash the same
/// input. Uniqueness across processes is finally enforced by the store.
pub fn generate_job_id() -> String {
    let nanos = current_unix_timestamp_nanos();
    let sequence = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{}:{nanos}:{sequence}", std::process::id());
    let digest = format!("{:x}", Sha256::digest(seed.as_bytes()));
    digest[..JOB_ID_HEX_CHARS].to_string()
}
