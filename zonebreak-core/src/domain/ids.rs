use serde::{Deserialize, Serialize};
use std::fmt;

/// Zone identifier, allocated in sequence by a symbol's tracker and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub u64);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone-{}", self.0)
    }
}

/// Sequential id allocator for zones.
#[derive(Debug, Clone, Default)]
pub struct ZoneIdGen {
    next: u64,
}

impl ZoneIdGen {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> ZoneId {
        if self.next == 0 {
            self.next = 1;
        }
        let id = ZoneId(self.next);
        self.next += 1;
        id
    }
}
