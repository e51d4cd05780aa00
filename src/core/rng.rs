//! Signal Delay Randomization
//!
//! Uses Xorshift128+ for fast, high-quality, deterministic randomness.
//! The randomized extra delay before the "go" signal is drawn from an RNG
//! seeded by the duel's single-use signal nonce, so the delay cannot be
//! anticipated by clients but can be re-derived from the persisted nonce.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic PRNG using the Xorshift128+ algorithm.
///
/// Given the same seed, produces the exact same sequence on any platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG seeded from a duel's signal parameters.
    pub fn from_signal_params(
        signal_nonce: &[u8; 16],
        duel_id: &[u8; 16],
        player_ids: &[[u8; 16]],
    ) -> Self {
        let seed = derive_signal_seed(signal_nonce, duel_id, player_ids);
        Self::new(seed)
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }

    /// Draw the randomized extra signal delay in milliseconds, inclusive
    /// of both bounds.
    #[inline]
    pub fn signal_delay_ms(&mut self, min_ms: u32, max_ms: u32) -> u32 {
        if min_ms >= max_ms {
            return min_ms;
        }
        let range = max_ms - min_ms + 1;
        min_ms + self.next_int(range)
    }

    /// Get current state (for debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the signal delay seed for a duel.
///
/// The seed:
/// 1. Cannot be predicted before the single-use nonce is generated
/// 2. Cannot be manipulated by either player
/// 3. Is re-derivable from the persisted nonce for auditing
///
/// # Parameters
///
/// - `signal_nonce`: fresh single-use nonce minted at arming
/// - `duel_id`: unique duel identifier
/// - `player_ids`: both player IDs (MUST be sorted for determinism)
pub fn derive_signal_seed(
    signal_nonce: &[u8; 16],
    duel_id: &[u8; 16],
    player_ids: &[[u8; 16]],
) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"SNAPDUEL_SIGNAL_V1");

    // Single-use nonce (unpredictable entropy)
    hasher.update(signal_nonce);

    // Duel ID (unique per duel)
    hasher.update(duel_id);

    // Player IDs (sorted for determinism)
    // IMPORTANT: Caller must ensure player_ids is sorted!
    for pid in player_ids {
        hasher.update(pid);
    }

    let hash = hasher.finalize();

    // Take first 8 bytes as seed
    u64::from_le_bytes(hash[0..8].try_into().unwrap())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        // Same seed must produce same sequence
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(54321);

        // Very unlikely to match
        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_next_int() {
        let mut rng = DeterministicRng::new(1234);

        for _ in 0..1000 {
            let val = rng.next_int(100);
            assert!(val < 100);
        }

        // Edge case: max = 0
        assert_eq!(rng.next_int(0), 0);

        // Edge case: max = 1
        assert_eq!(rng.next_int(1), 0);
    }

    #[test]
    fn test_signal_delay_within_bounds() {
        let mut rng = DeterministicRng::new(5678);

        for _ in 0..1000 {
            let delay = rng.signal_delay_ms(1000, 4000);
            assert!((1000..=4000).contains(&delay));
        }

        // Degenerate range collapses to min
        assert_eq!(rng.signal_delay_ms(2000, 2000), 2000);
        assert_eq!(rng.signal_delay_ms(3000, 1000), 3000);
    }

    #[test]
    fn test_derive_signal_seed() {
        let nonce = [7u8; 16];
        let duel_id = [1u8; 16];
        let player_ids = [[2u8; 16], [3u8; 16]];

        let seed1 = derive_signal_seed(&nonce, &duel_id, &player_ids);
        let seed2 = derive_signal_seed(&nonce, &duel_id, &player_ids);

        // Same inputs = same seed
        assert_eq!(seed1, seed2);

        // A different nonce must change the delay
        let other_nonce = [8u8; 16];
        let seed3 = derive_signal_seed(&other_nonce, &duel_id, &player_ids);
        assert_ne!(seed1, seed3);
    }

    #[test]
    fn test_delay_varies_across_nonces() {
        let duel_id = [1u8; 16];
        let players = [[2u8; 16], [3u8; 16]];

        let mut distinct = std::collections::BTreeSet::new();
        for i in 0..32u8 {
            let nonce = [i; 16];
            let mut rng = DeterministicRng::from_signal_params(&nonce, &duel_id, &players);
            distinct.insert(rng.signal_delay_ms(1000, 4000));
        }

        // 32 nonces over a 3000ms range should not collapse to a handful
        assert!(distinct.len() > 16);
    }
}
