// Opaque identifier generation

use crate::broker::message::Id;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::Mutex;

/// Draws opaque ids from a single CSPRNG. The generator state is
/// advanced under a lock, so no two callers observe overlapping output.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    /// Create a generator seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a deterministic generator for tests.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Return `n` fresh random bytes. Callers must treat the result as
    /// opaque; there is no structure to rely on.
    pub async fn fresh(&self, n: usize) -> Id {
        let mut rng = self.rng.lock().await;
        let mut bytes = vec![0u8; n];
        rng.fill_bytes(&mut bytes);
        Id(bytes)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
