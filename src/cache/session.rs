//! Per-conversation bookkeeping.
//!
//! Every session id owns a fixed logical slot window of `max_model_len`
//! slots starting at `session_id * max_model_len`. Entries are created on
//! first use and never removed.

use std::collections::HashMap;

use thiserror::Error;

/// Identifies one conversation / decode stream.
pub type SessionId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Logical window of session {session_id} is not addressable")]
    WindowOverflow { session_id: SessionId },
}

/// Decode progress and logical window of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// First logical slot of the window.
    pub slot_start: usize,

    /// One past the last logical slot of the window.
    pub slot_end: usize,

    /// Tokens already written to the cache.
    pub context_len: usize,
}

impl SessionState {
    /// Logical slot range currently holding tokens.
    pub fn filled_slots(&self) -> std::ops::Range<usize> {
        self.slot_start..self.slot_start + self.context_len
    }

    /// Slots left in the window.
    pub fn remaining(&self) -> usize {
        (self.slot_end - self.slot_start).saturating_sub(self.context_len)
    }
}

/// Lazily populated session table.
#[derive(Debug, Clone)]
pub struct SessionTable {
    /// Window length, in slots, shared by every session.
    max_model_len: usize,

    /// Sessions seen so far. Entries are never removed.
    sessions: HashMap<SessionId, SessionState>,
}

impl SessionTable {
    /// An empty table whose sessions each own `max_model_len` slots.
    pub fn new(max_model_len: usize) -> Self {
        Self {
            max_model_len,
            sessions: HashMap::new(),
        }
    }

    /// The state a session has, or would have if created now.
    pub fn window_for(&self, session_id: SessionId) -> Result<SessionState, SessionError> {
        if let Some(state) = self.sessions.get(&session_id) {
            return Ok(*state);
        }
        let overflow = SessionError::WindowOverflow { session_id };
        let slot_start = usize::try_from(session_id)
            .ok()
            .and_then(|id| id.checked_mul(self.max_model_len))
            .ok_or_else(|| overflow.clone())?;
        let slot_end = slot_start
            .checked_add(self.max_model_len)
            .ok_or(overflow)?;
        Ok(SessionState {
            slot_start,
            slot_end,
            context_len: 0,
        })
    }

    /// Fetch a session, creating it with an empty context on first access.
    pub fn get_or_create(
        &mut self,
        session_id: SessionId,
    ) -> Result<&mut SessionState, SessionError> {
        if !self.sessions.contains_key(&session_id) {
            let state = self.window_for(session_id)?;
            self.sessions.insert(session_id, state);
        }
        self.sessions
            .get_mut(&session_id)
            .ok_or(SessionError::WindowOverflow { session_id })
    }

    /// Look up a session without creating it.
    pub fn get(&self, session_id: SessionId) -> Option<&SessionState> {
        self.sessions.get(&session_id)
    }

    /// All sessions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &SessionState)> {
        self.sessions.iter().map(|(id, state)| (*id, state))
    }

    /// Number of sessions seen so far.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Window length of every session, in slots.
    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_fixed_per_id() {
        let mut table = SessionTable::new(32);

        let state = table.get_or_create(3).unwrap();
        assert_eq!(state.slot_start, 96);
        assert_eq!(state.slot_end, 128);
        assert_eq!(state.context_len, 0);

        state.context_len = 10;
        let again = table.get_or_create(3).unwrap();
        assert_eq!(again.slot_start, 96);
        assert_eq!(again.context_len, 10);
        assert_eq!(again.remaining(), 22);
        assert_eq!(again.filled_slots(), 96..106);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_does_not_create() {
        let mut table = SessionTable::new(8);
        assert!(table.is_empty());
        assert!(table.get(1).is_none());
        assert_eq!(table.max_model_len(), 8);

        table.get_or_create(1).unwrap().context_len = 3;
        table.get_or_create(4).unwrap();
        let mut seen: Vec<_> = table.iter().map(|(id, s)| (id, s.context_len)).collect();
        seen.sort();
        assert_eq!(seen, vec![(1, 3), (4, 0)]);
        assert_eq!(table.get(4).map(|s| s.slot_start), Some(32));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_window_for_does_not_insert() {
        let table = SessionTable::new(16);
        let state = table.window_for(2).unwrap();
        assert_eq!(state.slot_start, 32);
        assert!(table.is_empty());
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_window_overflow() {
        let mut table = SessionTable::new(1 << 20);
        assert_eq!(
            table.get_or_create(u64::MAX),
            Err(SessionError::WindowOverflow {
                session_id: u64::MAX
            })
        );
        assert!(table.is_empty());
    }
}
