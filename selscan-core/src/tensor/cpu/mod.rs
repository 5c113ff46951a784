mod allocate;

pub use allocate::{SampleTensor, TensorFromVec, ZerosTensor};

use rand::{rngs::StdRng, SeedableRng};
use std::sync::{Arc, Mutex};

/// A device that stores data on the heap.
///
/// The [Default] impl seeds the rng with 0.
#[derive(Clone, Debug)]
pub struct Cpu {
    pub(crate) rng: Arc<Mutex<StdRng>>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Cpu {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}
