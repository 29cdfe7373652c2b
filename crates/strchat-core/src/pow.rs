//! Nonce mining and verification for NIP-13 style proof of work.

use nostr_sdk::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::event::EventDraft;

/// Iterations between cancellation checks while mining.
const CANCEL_CHECK_MASK: u64 = 0x3FF;

/// Leading zero bits contributed by each byte value when read as a hex
/// digit. `None` for bytes that are not hex digits.
const NIBBLE_ZEROS: [Option<u8>; 256] = build_nibble_table();

const fn build_nibble_table() -> [Option<u8>; 256] {
    let mut table = [None; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        let value = match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        };
        table[i] = match value {
            Some(0) => Some(4),
            Some(v) => Some((v << 4).leading_zeros() as u8),
            None => None,
        };
        i += 1;
    }
    table
}

/// Count leading zero bits of a hex digest. Stops at the first non-zero
/// nibble; an unrecognized character ends counting.
pub fn leading_zero_bits(hex_digest: &str) -> u32 {
    let mut count = 0u32;
    for b in hex_digest.bytes() {
        let Some(zeros) = NIBBLE_ZEROS[b as usize] else {
            return count;
        };
        count += u32::from(zeros);
        if zeros != 4 {
            break;
        }
    }
    count
}

/// Difficulty declared by the last `nonce` tag, if it parses.
fn declared_difficulty(event: &Event) -> Option<u32> {
    event
        .tags
        .iter()
        .rev()
        .find(|tag| tag.as_slice().first().map(String::as_str) == Some("nonce"))
        .and_then(|tag| tag.as_slice().get(2))
        .and_then(|d| d.trim().parse::<u32>().ok())
}

/// An event meets `min_difficulty` when its last nonce tag declares at
/// least that much and the id actually has the declared leading zeros.
pub fn is_pow_valid(event: &Event, min_difficulty: u32) -> bool {
    if min_difficulty == 0 {
        return true;
    }
    let Some(declared) = declared_difficulty(event) else {
        return false;
    };
    if declared < min_difficulty {
        return false;
    }
    leading_zero_bits(&event.id.to_hex()) >= declared
}

/// Search nonces until the draft's id has `difficulty` leading zero bits.
/// Returns `None` if `cancel` fires; partial work is discarded. CPU bound,
/// run it on a blocking thread.
pub fn mine(
    mut draft: EventDraft,
    pubkey: &PublicKey,
    difficulty: u32,
    cancel: &CancellationToken,
) -> Option<EventDraft> {
    draft.tags.push(vec![
        "nonce".to_string(),
        "0".to_string(),
        difficulty.to_string(),
    ]);
    let nonce_idx = draft.tags.len() - 1;
    let mut nonce: u64 = 0;
    loop {
        if nonce & CANCEL_CHECK_MASK == 0 && cancel.is_cancelled() {
            return None;
        }
        draft.tags[nonce_idx][1] = nonce.to_string();
        if leading_zero_bits(&draft.id_hex(pubkey)) >= difficulty {
            return Some(draft);
        }
        nonce = nonce.wrapping_add(1);
    }
}
