//! Per-provider-group credential pools with a round-robin cursor.
//!
//! The cursor always indexes the next entry to try, modulo the current pool
//! size. Every mutation happens under the pool mutex so concurrent callers
//! fan out across entries instead of converging on one.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::credential::{Credential, ProviderGroup};

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<Arc<Credential>>,
    cursor: usize,
}

#[derive(Debug)]
pub struct CredentialPool {
    group: ProviderGroup,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(group: ProviderGroup) -> Self {
        Self {
            group,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn group(&self) -> ProviderGroup {
        self.group
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn entries(&self) -> Vec<Arc<Credential>> {
        self.state.lock().entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Credential>> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Append a credential, or replace an existing entry with the same id in
    /// place. Returns `true` when the entry is new.
    pub fn upsert(&self, credential: Arc<Credential>) -> bool {
        let mut state = self.state.lock();
        if let Some(slot) = state.entries.iter_mut().find(|c| c.id() == credential.id()) {
            *slot = credential;
            false
        } else {
            state.entries.push(credential);
            true
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Credential>> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|c| c.id() == id)?;
        Some(remove_at(&mut state, index))
    }

    /// Drop every entry whose id is not in `keep`. Returns the removed entries.
    pub fn retain_ids(&self, keep: &HashSet<String>) -> Vec<Arc<Credential>> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        let mut index = 0;
        while index < state.entries.len() {
            if keep.contains(state.entries[index].id()) {
                index += 1;
            } else {
                removed.push(remove_at(&mut state, index));
            }
        }
        removed
    }

    /// Walk the pool once, starting at the cursor, and return the first entry
    /// accepted by `eligible`. The cursor moves to just past the chosen entry.
    pub(crate) fn pick(
        &self,
        mut eligible: impl FnMut(&Arc<Credential>) -> bool,
    ) -> Option<Arc<Credential>> {
        let mut state = self.state.lock();
        let len = state.entries.len();
        if len == 0 {
            return None;
        }
        let start = state.cursor % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if eligible(&state.entries[index]) {
                state.cursor = (index + 1) % len;
                return Some(Arc::clone(&state.entries[index]));
            }
        }
        None
    }
}

fn remove_at(state: &mut PoolState, index: usize) -> Arc<Credential> {
    let removed = state.entries.remove(index);
    if index < state.cursor {
        state.cursor -= 1;
    }
    if state.cursor >= state.entries.len() {
        state.cursor = 0;
    }
    removed
}

/// The pools for both provider groups, constructed once at startup and shared
/// by the store, the rotator and the dispatcher.
#[derive(Debug)]
pub struct AccountPools {
    claude: CredentialPool,
    gemini: CredentialPool,
}

impl Default for AccountPools {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountPools {
    pub fn new() -> Self {
        Self {
            claude: CredentialPool::new(ProviderGroup::Claude),
            gemini: CredentialPool::new(ProviderGroup::Gemini),
        }
    }

    pub fn get(&self, group: ProviderGroup) -> &CredentialPool {
        match group {
            ProviderGroup::Claude => &self.claude,
            ProviderGroup::Gemini => &self.gemini,
        }
    }

    pub fn find(&self, id: &str) -> Option<Arc<Credential>> {
        ProviderGroup::ALL
            .iter()
            .find_map(|group| self.get(*group).get(id))
    }

    pub fn total(&self) -> usize {
        self.claude.len() + self.gemini.len()
    }
}
