//! Transactional store of open positions.
//!
//! The book is the only thing that inserts, mutates, or removes a
//! [`Position`]. Every check-then-act sequence runs under one lock, so two
//! workers racing to open can never exceed the cap or double up on a symbol.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::Rejection;
use crate::domain::Position;
use crate::sync::lock;

#[derive(Debug)]
pub struct PositionBook {
    max_positions: usize,
    positions: Mutex<BTreeMap<String, Position>>,
}

impl PositionBook {
    pub fn new(max_positions: usize) -> Self {
        Self {
            max_positions,
            positions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Atomically check the cap and the one-per-symbol rule, then insert.
    pub fn try_open(&self, position: Position) -> Result<(), Rejection> {
        let mut positions = lock(&self.positions);
        if positions.contains_key(&position.symbol) {
            return Err(Rejection::SymbolOccupied {
                symbol: position.symbol,
            });
        }
        if positions.len() >= self.max_positions {
            return Err(Rejection::CapReached {
                max: self.max_positions,
            });
        }
        positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    /// Remove and return the position for `symbol`.
    pub fn close(&self, symbol: &str) -> Option<Position> {
        lock(&self.positions).remove(symbol)
    }

    /// Run `f` against the open position for `symbol` under the book lock.
    pub fn with_position<R>(&self, symbol: &str, f: impl FnOnce(&mut Position) -> R) -> Option<R> {
        lock(&self.positions).get_mut(symbol).map(f)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        lock(&self.positions).get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        lock(&self.positions).contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        lock(&self.positions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_positions
    }

    pub fn symbols(&self) -> Vec<String> {
        lock(&self.positions).keys().cloned().collect()
    }

    /// Snapshot ordered by symbol.
    pub fn snapshot(&self) -> Vec<Position> {
        lock(&self.positions).values().cloned().collect()
    }
}
