//! Inbound tunnel validation handshake
//!
//! A legitimate client proves itself with a one-shot token masked by the
//! shared time-key: a random amount of padding defeats fixed-offset and
//! fixed-length traffic fingerprinting, and a masked timestamp bounds the
//! replay window for captured tokens. The verifier never sends anything,
//! so a scanner probing the port learns nothing from the exchange.

use crate::seed::Seed;
use crate::trace::ConnectionId;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest accepted decoded padding length; anything above is treated as a
/// protocol violation, bounding the attacker-controlled read size.
pub const MAX_RANDOM_PADDING: i64 = 20;

/// Allowed clock skew between the token timestamp and verification time.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 10_000;

const BASE_TIMEOUT_MS: u64 = 5_000;
const TIMEOUT_JITTER_MS: u64 = 10_000;

/// Run the handshake check under a jittered deadline (5s plus up to 10s, so
/// the check itself has no fixed-duration fingerprint). Expiry cancels the
/// pending read; every failure mode reports `false`.
pub async fn validate<S>(id: ConnectionId, stream: &mut S, seed: &Seed) -> bool
where
    S: AsyncRead + Unpin,
{
    let deadline =
        Duration::from_millis(BASE_TIMEOUT_MS + thread_rng().gen_range(0..TIMEOUT_JITTER_MS));
    match tokio::time::timeout(deadline, validate_token(id, stream, seed)).await {
        Ok(valid) => valid,
        Err(_) => {
            log::info!("[{id}] validation failed: deadline expired");
            false
        }
    }
}

async fn validate_token<S>(id: ConnectionId, stream: &mut S, seed: &Seed) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut word = [0u8; 8];
    if stream.read_exact(&mut word).await.is_err() {
        log::info!("[{id}] validation failed: short read on length header");
        return false;
    }

    let random_len = i64::from_le_bytes(word) ^ seed.time_key();
    if !(0..=MAX_RANDOM_PADDING).contains(&random_len) {
        log::info!("[{id}] validation failed: padding length out of bounds");
        return false;
    }

    let lead = seed.pad_begin() + random_len as usize;
    let mut discard = vec![0u8; lead];
    if stream.read_exact(&mut discard).await.is_err() {
        log::info!("[{id}] validation failed: short read on leading padding");
        return false;
    }

    if stream.read_exact(&mut word).await.is_err() {
        log::info!("[{id}] validation failed: short read on timestamp");
        return false;
    }
    let stamp_ms = i64::from_le_bytes(word) ^ seed.time_key();
    let now_ms = Utc::now().timestamp_millis();
    if (now_ms - stamp_ms).abs() > MAX_TIMESTAMP_SKEW_MS {
        log::info!("[{id}] validation failed: timestamp outside the replay window ({stamp_ms})");
        return false;
    }

    let mut tail = vec![0u8; seed.pad_end()];
    if stream.read_exact(&mut tail).await.is_err() {
        log::info!("[{id}] validation failed: short read on trailing padding");
        return false;
    }

    true
}

/// Build the one-shot token a client-role connection writes upstream before
/// any tunnel data.
pub fn generate_token(seed: &Seed) -> Bytes {
    let random_len = thread_rng().gen_range(0..MAX_RANDOM_PADDING) as usize;
    token_with(seed, random_len, Utc::now().timestamp_millis())
}

fn token_with(seed: &Seed, random_len: usize, stamp_ms: i64) -> Bytes {
    let len = seed.pad_begin() + seed.pad_end() + 16 + random_len;
    let mut token = BytesMut::zeroed(len);
    // Random filler everywhere first, then the two masked words punched in.
    OsRng.fill_bytes(&mut token);
    token[0..8].copy_from_slice(&(seed.time_key() ^ random_len as i64).to_le_bytes());
    let stamp_at = 8 + random_len + seed.pad_begin();
    token[stamp_at..stamp_at + 8].copy_from_slice(&(stamp_ms ^ seed.time_key()).to_le_bytes());
    token.freeze()
}
