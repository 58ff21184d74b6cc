//! Game-specific "is the game loaded" predicates

use crate::config::PointerChainConfig;
use crate::memory::{MemoryAccessor, PointerChain};

/// Decides on each refresh whether the game is loaded
pub trait LoadedCheck {
    fn is_loaded(&mut self, memory: &MemoryAccessor) -> bool;
}

impl<F> LoadedCheck for F
where
    F: FnMut(&MemoryAccessor) -> bool,
{
    fn is_loaded(&mut self, memory: &MemoryAccessor) -> bool {
        self(memory)
    }
}

/// Loaded while a pointer chain resolves
///
/// Most games keep a world or character object behind a static pointer that
/// is null outside of gameplay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerLoadedCheck {
    chain: PointerChain,
}

impl PointerLoadedCheck {
    pub fn new(chain: PointerChain) -> Self {
        Self { chain }
    }

    pub fn from_config(config: &PointerChainConfig) -> Self {
        Self::new(config.to_chain())
    }

    pub fn chain(&self) -> &PointerChain {
        &self.chain
    }
}

impl LoadedCheck for PointerLoadedCheck {
    fn is_loaded(&mut self, memory: &MemoryAccessor) -> bool {
        memory.resolve(&self.chain).is_some()
    }
}
