//! Seeded random source for genome operations.

use rand::prelude::*;

/// Stream id used for the initial random population.
pub const INIT_STREAM: u64 = u64::MAX;

/// Random number generator wrapper for genome operations.
pub struct GenomeRng {
    rng: StdRng,
}

impl GenomeRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Independent generator for one numbered stream of a run.
    ///
    /// Streams are keyed by generation so a recovered run draws exactly what an
    /// uninterrupted one would have.
    pub fn for_stream(base_seed: u64, stream: u64) -> Self {
        Self::new(splitmix64(
            base_seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        ))
    }

    /// Uniform draw in [0, 1).
    pub fn unit(&mut self) -> f64 {
        loop {
            let r: f64 = self.rng.r#gen();
            if r < 1.0 {
                return r;
            }
        }
    }

    /// Generate next u64 for seeding child RNGs.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.r#gen()
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
