//! Process-wide secret material shared read-only by all connections
//!
//! The seed is a 128-byte random blob generated once and persisted under the
//! config root; every restart reuses it. The validation time-key and the
//! padding-length bounds of the handshake token are derived from fixed
//! positions in the blob, so both roles of a deployment only need to share
//! the file, never exchange anything on the wire.

use crate::env::Env;
use crate::ProxyError;
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use std::fs;
use std::time::Duration;

/// File name of the persisted secret blob under the config root.
pub const SEED_FILE: &str = "seed";

const SEED_LEN: usize = 128;

/// Secret material derived from the persisted seed blob. Immutable after
/// load; shared by reference across all connections.
pub struct Seed {
    time_key: i64,
    pad_begin: usize,
    pad_end: usize,
    close_delay_secs: u64,
}

impl Seed {
    /// Load the persisted seed, generating and storing a fresh one on first
    /// run. The file is never rewritten once it exists.
    pub fn load(env: &Env) -> Result<Self, ProxyError> {
        let path = env.config_root().join(SEED_FILE);
        let blob = if path.exists() {
            fs::read(&path)?
        } else {
            let mut blob = vec![0u8; SEED_LEN];
            OsRng.fill_bytes(&mut blob);
            fs::create_dir_all(env.config_root())?;
            fs::write(&path, &blob)?;
            log::info!("generated new seed file at {}", path.display());
            blob
        };
        Self::from_blob(&blob)
    }

    pub(crate) fn from_blob(blob: &[u8]) -> Result<Self, ProxyError> {
        if blob.len() < 11 {
            return Err(ProxyError::InvalidSeed(format!(
                "seed blob too short: {} bytes",
                blob.len()
            )));
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&blob[0..8]);
        Ok(Self {
            time_key: i64::from_le_bytes(key),
            pad_begin: (blob[8] & 0x1f) as usize,
            pad_end: (blob[9] & 0x1f) as usize,
            // Fixed reading of the delay bound: shift first, then offset.
            close_delay_secs: ((blob[10] >> 4) + 5) as u64,
        })
    }

    /// 64-bit key XOR-masking the lengths and timestamps in validation tokens.
    pub fn time_key(&self) -> i64 {
        self.time_key
    }

    /// Leading discard-padding length of a validation token (0..=31).
    pub fn pad_begin(&self) -> usize {
        self.pad_begin
    }

    /// Trailing discard-padding length of a validation token (0..=31).
    pub fn pad_end(&self) -> usize {
        self.pad_end
    }

    /// Randomized wait applied before closing a connection that failed
    /// validation, so that rejection is not distinguishable from a slow
    /// peer by timing alone.
    pub fn close_delay(&self) -> Duration {
        let bound_ms = (self.close_delay_secs + 5) * 1000;
        Duration::from_millis(thread_rng().gen_range(0..bound_ms))
    }
}
