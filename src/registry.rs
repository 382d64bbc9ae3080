//! Session registry
//!
//! Slot map of live sessions for the single-process run modes. Slot ids
//! are stable for a session's lifetime and double as event-loop keys.

use crate::session::{Session, Status, Takeover};

#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, assigning it the first free slot id
    pub fn insert(&mut self, mut session: Session) -> usize {
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        session.id = id;
        self.slots[id] = Some(session);
        id
    }

    pub fn get(&self, id: usize) -> Option<&Session> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Session> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: usize) -> Option<Session> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live slot ids; safe to iterate while mutating
    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
            .collect()
    }

    /// Mutable access to two distinct sessions at once
    pub fn two_mut(&mut self, a: usize, b: usize) -> Option<(&mut Session, &mut Session)> {
        if a == b || a >= self.slots.len() || b >= self.slots.len() {
            return None;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi);
        let lo_session = left[lo].as_mut()?;
        let hi_session = right[0].as_mut()?;
        if a < b {
            Some((lo_session, hi_session))
        } else {
            Some((hi_session, lo_session))
        }
    }

    /// Find the established session a new connection with this nick could
    /// take over: identified under the same nick, not already entangled in
    /// a takeover, and still holding a socket
    pub fn find_takeover_peer(&self, me: usize, nick: &str) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|s| (id, s)))
            .find(|(id, s)| {
                *id != me
                    && s.status.contains(Status::IDENTIFIED)
                    && !s.status.contains(Status::SHUTDOWN)
                    && s.takeover == Takeover::Idle
                    && !s.desynced
                    && s.raw_fd().is_some()
                    && s.nick.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(nick))
            })
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(nick: &str) -> Session {
        let mut s = Session::detached("gw.test".to_string());
        s.nick = Some(nick.to_string());
        s
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut reg = Registry::new();
        let a = reg.insert(session("a"));
        let b = reg.insert(session("b"));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        reg.remove(a);
        let c = reg.insert(session("c"));
        assert_eq!(c, a);
        assert_eq!(reg.get(c).unwrap().nick.as_deref(), Some("c"));
    }

    #[test]
    fn two_mut_returns_distinct_sessions_in_argument_order() {
        let mut reg = Registry::new();
        let a = reg.insert(session("a"));
        let b = reg.insert(session("b"));

        let (first, second) = reg.two_mut(b, a).unwrap();
        assert_eq!(first.nick.as_deref(), Some("b"));
        assert_eq!(second.nick.as_deref(), Some("a"));

        assert!(reg.two_mut(a, a).is_none());
        assert!(reg.two_mut(a, 99).is_none());
    }

    #[test]
    fn takeover_peer_requires_an_identified_idle_match() {
        let mut reg = Registry::new();
        let newcomer = reg.insert(session("bob"));

        // No peer when nobody else is identified under the nick.
        let other = reg.insert(session("bob"));
        assert_eq!(reg.find_takeover_peer(newcomer, "bob"), None);

        reg.get_mut(other).unwrap().status.insert(Status::IDENTIFIED);
        // Detached sessions hold no socket, so still no candidate.
        assert_eq!(reg.find_takeover_peer(newcomer, "bob"), None);
    }
}
