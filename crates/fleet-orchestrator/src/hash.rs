//! Stable content hashing for checksums and deterministic decisions.
//!
//! Everything that must replay identically across restarts routes through
//! this module: message checksums, task and execution ids, candidate
//! selection, and seeded parameter derivation. The hashes are integrity
//! and determinism tools, not an authentication mechanism.

use rand::RngCore;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh32::xxh32;

/// 64-bit content hash used for message checksums.
pub fn content_hash64(input: &str) -> u64 {
    xxh3_64(input.as_bytes())
}

/// 32-bit mixing hash used to reduce a key onto a candidate list.
pub fn mix32(input: &str) -> u32 {
    xxh32(input.as_bytes(), 0)
}

/// Lowercase hex digest of the 64-bit content hash.
pub fn hex16(input: &str) -> String {
    format!("{:016x}", content_hash64(input))
}

/// Derive a deterministic task id from its identifying tuple.
pub fn task_id(task_type: &str, name: &str, epoch_ms: i64) -> String {
    format!("task-{}", hex16(&format!("{task_type}:{name}:{epoch_ms}")))
}

/// Derive a stable workflow execution id from the replay inputs.
pub fn execution_id(workflow_id: &str, context_json: &str, epoch_ms: i64) -> String {
    format!(
        "exec-{}",
        hex16(&format!("{workflow_id}:{context_json}:{epoch_ms}"))
    )
}

/// Seeded hash driving deterministic parameter fill for a workflow step.
pub fn seeded(seed: &str, step_id: &str, key: &str) -> u64 {
    content_hash64(&format!("{seed}:{step_id}:{key}"))
}

/// Derive a fresh 64-hex-char seed from startup entropy.
///
/// Callers persist the result so restarts replay the same routing and
/// parameter decisions.
pub fn derive_seed() -> String {
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy);
    let digest = Sha256::digest(entropy);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Pick an index into a sorted candidate list from a routing key.
pub fn pick_index(key: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    mix32(key) as usize % len
}
