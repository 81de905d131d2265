//! Chain-agnostic types shared by every part of the engine.

use std::{
    fmt,
    hash::Hash,
};

/// A hash (or address) type usable as a consensus key.
///
/// Blanket-implemented for every type with the listed bounds, so any chain's
/// fixed-width digest can be plugged in without a wrapper.
pub trait ConsensusHash:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + AsRef<[u8]> + Send + Sync + 'static
{
}

impl<T> ConsensusHash for T where
    T: Copy + Eq + Hash + fmt::Debug + fmt::Display + AsRef<[u8]> + Send + Sync + 'static
{
}

/// A transaction as seen by consensus: only its identity matters.
pub trait Transaction<H>: Clone {
    fn hash(&self) -> H;
}

/// A block produced from the consensus context.
///
/// The header is built first without transactions; `set_transactions` turns
/// it into the final block once every proposed transaction is known. The hash
/// must not depend on whether transactions have been attached.
pub trait Block<H, T>: Clone {
    fn hash(&self) -> H;
    fn index(&self) -> u32;
    /// Block timestamp in milliseconds.
    fn timestamp(&self) -> u64;
    fn transactions(&self) -> &[T];
    fn set_transactions(&mut self, txs: Vec<T>);
}

/// Draft block exchanged through the anti-MEV pre-commit phase.
pub trait PreBlock<T>: Clone {
    fn set_transactions(&mut self, txs: Vec<T>);
}

/// Hosts that never enable the anti-MEV extension can use `()`.
impl<T> PreBlock<T> for () {
    fn set_transactions(&mut self, _txs: Vec<T>) {}
}

/// A (height, view) pair. Orders by height first, then view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeightView {
    pub height: u32,
    pub view: u8,
}

impl HeightView {
    pub fn new(height: u32, view: u8) -> Self {
        Self { height, view }
    }
}

impl fmt::Display for HeightView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.view)
    }
}
