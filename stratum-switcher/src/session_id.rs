//! Session id allocation.
//!
//! Each switcher instance owns one index space, tagged with its server id in
//! the high bits of every [`SessionId`] it hands out. The index is 24 bits
//! wide on Bitcoin and 16 bits on Ethereum. Indexes are tracked in a bitmap;
//! allocation scans forward from a cursor so that a freed index is not reused
//! until the cursor wraps around to it. This keeps a reconnecting miner from
//! inheriting the extranonce of a session that only just disappeared.

use bitvec::prelude::*;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::{index_mask, max_valid_index, ChainType, SessionId};

/// Thread-safe allocator of session ids for one server.
pub struct SessionIdAllocator {
    chain: ChainType,
    server_id: u8,
    alloc_interval: u32,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    used: BitVec<u64, Lsb0>,
    count: u32,
    cursor: u32,
}

impl SessionIdAllocator {
    /// Create an allocator for `server_id` on `chain`. The server id must be
    /// non-zero.
    pub fn new(chain: ChainType, server_id: u8) -> Result<Self> {
        if server_id == 0 {
            return Err(Error::Config(
                "server id must be between 1 and 255".into(),
            ));
        }

        Ok(Self {
            chain,
            server_id,
            alloc_interval: chain.alloc_interval(),
            state: Mutex::new(AllocatorState {
                used: BitVec::repeat(false, index_mask(chain) as usize),
                count: 0,
                cursor: 0,
            }),
        })
    }

    pub fn server_id(&self) -> u8 {
        self.server_id
    }

    fn capacity(&self) -> u32 {
        index_mask(self.chain)
    }

    // Indexes wrap from the highest valid index back to zero.
    fn advance(&self, index: u32, by: u32) -> u32 {
        (index + by) % (max_valid_index(self.chain) + 1)
    }

    /// Allocate the next free id at or after the cursor.
    pub fn alloc(&self) -> Result<SessionId> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if state.count >= self.capacity() {
            return Err(Error::SessionIdFull);
        }

        while state.used[state.cursor as usize] {
            state.cursor = self.advance(state.cursor, 1);
        }

        let index = state.cursor;
        state.used.set(index as usize, true);
        state.count += 1;
        state.cursor = self.advance(index, self.alloc_interval);

        Ok(SessionId::new(self.chain, self.server_id, index))
    }

    // Index of `id` if it belongs to this allocator.
    fn own_index(&self, id: SessionId) -> Option<u32> {
        let index = id.index(self.chain);
        let ours = id.server_id(self.chain) == self.server_id
            && SessionId::new(self.chain, self.server_id, index) == id
            && index <= max_valid_index(self.chain);
        ours.then_some(index)
    }

    /// Mark a specific id as in use, as when sessions are restored after an
    /// upgrade.
    pub fn resume(&self, id: SessionId) -> Result<()> {
        let index = self
            .own_index(id)
            .ok_or(Error::InvalidSessionId(id.as_u32()))?;

        let mut state = self.state.lock();
        if state.used[index as usize] {
            return Err(Error::SessionIdOccupied(id.as_u32()));
        }

        state.used.set(index as usize, true);
        state.count += 1;
        if state.cursor <= index {
            state.cursor = self.advance(index, 1);
        }

        Ok(())
    }

    /// Release an id. Freeing an id that is not in use is a no-op.
    pub fn free(&self, id: SessionId) {
        let Some(index) = self.own_index(id) else {
            return;
        };

        let mut state = self.state.lock();
        if state.used[index as usize] {
            state.used.set(index as usize, false);
            state.count -= 1;
        }
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().count >= self.capacity()
    }

    /// Number of ids currently in use.
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    #[cfg(test)]
    fn fill(&self) {
        let mut state = self.state.lock();
        state.used.fill(true);
        state.count = self.capacity();
    }
}
