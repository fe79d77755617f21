use std::sync::Arc;

use anyhow::{bail, Result};

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<String>,
    flushed: bool,
    closed: bool,
    rejects: usize,
}

/// In-process row collector. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<parking_lot::Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, row: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.rejects > 0 {
            state.rejects -= 1;
            bail!("memory sink rejected row");
        }
        state.rows.push(row.to_string());
        state.flushed = false;
        Ok(())
    }

    /// Make the next `n` writes fail without storing their rows.
    pub fn reject_next_writes(&self, n: usize) {
        self.state.lock().rejects = n;
    }

    pub(crate) fn mark_flushed(&self) {
        self.state.lock().flushed = true;
    }

    pub(crate) fn mark_closed(&self) {
        self.state.lock().closed = true;
    }

    /// Snapshot of every row written so far, in write order.
    pub fn rows(&self) -> Vec<String> {
        self.state.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.state.lock().flushed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
