use std::sync::{Mutex, PoisonError};

use rand::{rngs::StdRng, Rng, SeedableRng};
use uuid::Uuid;

/// Process-unique identifier of a WebSocket connection.
pub type ConnectionId = Uuid;

/// Source of fresh [`ConnectionId`]s.
///
/// Created once when the server starts and shared by reference with the handshake, so the
/// random state has an explicit owner. Seed it with [`IdGenerator::seeded`] for reproducible
/// ids in tests.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    /// A generator seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// A deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Returns a random (version 4) identifier.
    pub fn next_id(&self) -> ConnectionId {
        let bytes: [u8; 16] = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}
