/*
 * SPDX-FileCopyrightText: 2026 Firefeed Project
 * SPDX-License-Identifier: MIT
 */

use rand::{rngs::OsRng, RngCore};
use std::sync::Mutex;

// 64 symbols in ASCII order, so ids compare byte-wise in generation order.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TS_CHARS: usize = 8;
const TAIL_CHARS: usize = 12;

/// Generates 20-character spark ids that sort lexicographically by creation
/// time: 8 characters of millisecond timestamp followed by 12 random
/// characters. Ids minted in the same millisecond (or after the clock steps
/// backwards) increment the previous tail, so a single generator never emits
/// an id that is not strictly greater than the one before it.
pub struct PushIdGenerator {
    inner: Mutex<GenState>,
}

struct GenState {
    last_ms: i64,
    tail: [usize; TAIL_CHARS],
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GenState {
                last_ms: 0,
                tail: [0; TAIL_CHARS],
            }),
        }
    }

    pub fn generate(&self) -> String {
        let now = now_ms();
        let mut g = self.inner.lock().expect("push id state poisoned");
        if now > g.last_ms {
            g.last_ms = now;
            let mut bytes = [0u8; TAIL_CHARS];
            OsRng.fill_bytes(&mut bytes);
            for (slot, b) in g.tail.iter_mut().zip(bytes) {
                *slot = (b % 64) as usize;
            }
        } else {
            // Same millisecond, or the clock went backwards: keep the stored
            // timestamp and bump the tail.
            let mut i = TAIL_CHARS;
            loop {
                if i == 0 {
                    // Tail overflowed; borrow a millisecond to stay monotonic.
                    g.last_ms += 1;
                    g.tail = [0; TAIL_CHARS];
                    break;
                }
                i -= 1;
                if g.tail[i] < 63 {
                    g.tail[i] += 1;
                    break;
                }
                g.tail[i] = 0;
            }
        }

        let mut out = [0u8; TS_CHARS + TAIL_CHARS];
        let mut ts = g.last_ms;
        for slot in out[..TS_CHARS].iter_mut().rev() {
            *slot = ALPHABET[(ts % 64) as usize];
            ts /= 64;
        }
        for (slot, idx) in out[TS_CHARS..].iter_mut().zip(g.tail) {
            *slot = ALPHABET[idx];
        }
        String::from_utf8(out.to_vec()).expect("alphabet is ascii")
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
