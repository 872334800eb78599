//! Connection registry and client/destination pairing.
//!
//! Every socket the event loop polls (other than the listener and the
//! resolver socket) lives in a generational arena and is addressed by a
//! [`ConnId`]. A slot index is reused after a connection closes, but its
//! generation is not, so a stale id can never alias a newer connection.
//!
//! [`SessionTable`] owns that arena together with the client/destination
//! pairing and the in-flight DNS queries. Pairings are only changed through
//! its methods, which always update both directions at once.

use crate::error::SessionError;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// ConnId is a stable handle to a connection in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u64,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

/// PendingQuery records a client waiting on a DNS reply
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuery {
    pub client: ConnId,
    pub port: u16,
    pub hostname: String,
    pub issued_at: Instant,
}

/// SessionTable holds every client and destination connection, the
/// client <-> destination pairing and the pending DNS queries
pub struct SessionTable<E> {
    slots: Vec<Slot<E>>,
    free: Vec<usize>,
    next_generation: u64,
    destinations_by_client: HashMap<ConnId, ConnId>,
    clients_by_destination: HashMap<ConnId, ConnId>,
    pending_dns: HashMap<u16, PendingQuery>,
}

impl<E> Default for SessionTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SessionTable<E> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 0,
            destinations_by_client: HashMap::new(),
            clients_by_destination: HashMap::new(),
            pending_dns: HashMap::new(),
        }
    }

    /// insert registers a new connection and returns its handle
    pub fn insert(&mut self, endpoint: E) -> ConnId {
        let generation = self.next_generation;
        self.next_generation += 1;

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Slot {
                    generation,
                    value: Some(endpoint),
                };
                index
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    value: Some(endpoint),
                });
                self.slots.len() - 1
            }
        };

        ConnId { index, generation }
    }

    pub fn get(&self, id: ConnId) -> Option<&E> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut E> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// ids snapshots the handles of every live connection
    pub fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| ConnId {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Removes the endpoint itself; mappings are handled by callers
    fn take(&mut self, id: ConnId) -> Option<E> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(id.index);
        Some(value)
    }

    /// bind pairs a client with its destination
    pub fn bind(&mut self, client: ConnId, destination: ConnId) -> Result<(), SessionError> {
        if !self.contains(client) || !self.contains(destination) {
            return Err(SessionError::UnknownConnection);
        }
        if self.destinations_by_client.contains_key(&client)
            || self.clients_by_destination.contains_key(&destination)
        {
            return Err(SessionError::AlreadyBound);
        }

        self.destinations_by_client.insert(client, destination);
        self.clients_by_destination.insert(destination, client);
        Ok(())
    }

    /// unbind_by_client removes the pairing of client and closes its
    /// destination, returning the removed destination endpoint
    pub fn unbind_by_client(&mut self, client: ConnId) -> Option<E> {
        let destination = self.destinations_by_client.remove(&client)?;
        self.clients_by_destination.remove(&destination);
        self.take(destination)
    }

    /// unbind_by_destination removes the pairing of destination and closes
    /// its client, returning the removed client endpoint
    pub fn unbind_by_destination(&mut self, destination: ConnId) -> Option<E> {
        let client = self.clients_by_destination.remove(&destination)?;
        self.destinations_by_client.remove(&client);
        self.purge_pending(client);
        self.take(client)
    }

    /// detach dissolves the pairing of id without closing either side and
    /// returns the former peer
    pub fn detach(&mut self, id: ConnId) -> Option<ConnId> {
        if let Some(destination) = self.destinations_by_client.remove(&id) {
            self.clients_by_destination.remove(&destination);
            return Some(destination);
        }

        let client = self.clients_by_destination.remove(&id)?;
        self.destinations_by_client.remove(&client);
        Some(client)
    }

    pub fn lookup_destination(&self, client: ConnId) -> Option<ConnId> {
        self.destinations_by_client.get(&client).copied()
    }

    pub fn lookup_client(&self, destination: ConnId) -> Option<ConnId> {
        self.clients_by_destination.get(&destination).copied()
    }

    /// lookup_peer returns the other side of a pairing, whichever side id is
    pub fn lookup_peer(&self, id: ConnId) -> Option<ConnId> {
        self.lookup_destination(id)
            .or_else(|| self.lookup_client(id))
    }

    /// teardown closes a connection and, if paired, its peer. Pending DNS
    /// queries issued for it are forgotten so late replies go unmatched
    pub fn teardown(&mut self, id: ConnId) -> Vec<E> {
        let mut closed = Vec::with_capacity(2);

        if let Some(peer) = self.unbind_by_client(id) {
            closed.push(peer);
        } else if let Some(peer) = self.unbind_by_destination(id) {
            closed.push(peer);
        }

        self.purge_pending(id);
        if let Some(endpoint) = self.take(id) {
            closed.push(endpoint);
        }

        closed
    }

    pub fn register_pending_dns(
        &mut self,
        query_id: u16,
        pending: PendingQuery,
    ) -> Result<(), SessionError> {
        if self.pending_dns.contains_key(&query_id) {
            return Err(SessionError::DuplicateQuery(query_id));
        }
        self.pending_dns.insert(query_id, pending);
        Ok(())
    }

    pub fn take_pending_dns(&mut self, query_id: u16) -> Option<PendingQuery> {
        self.pending_dns.remove(&query_id)
    }

    pub fn has_pending_dns(&self, query_id: u16) -> bool {
        self.pending_dns.contains_key(&query_id)
    }

    pub fn pending_dns_count(&self) -> usize {
        self.pending_dns.len()
    }

    /// expired_queries lists queries issued before the given instant
    pub fn expired_queries(&self, issued_before: Instant) -> Vec<u16> {
        self.pending_dns
            .iter()
            .filter(|(_, pending)| pending.issued_at < issued_before)
            .map(|(id, _)| *id)
            .collect()
    }

    fn purge_pending(&mut self, client: ConnId) {
        self.pending_dns.retain(|_, pending| pending.client != client);
    }

    /// is_symmetric checks that both pairing maps mirror each other and only
    /// reference live connections
    pub fn is_symmetric(&self) -> bool {
        self.destinations_by_client.len() == self.clients_by_destination.len()
            && self.destinations_by_client.iter().all(|(client, destination)| {
                self.clients_by_destination.get(destination) == Some(client)
                    && self.contains(*client)
                    && self.contains(*destination)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(client: ConnId) -> PendingQuery {
        PendingQuery {
            client,
            port: 80,
            hostname: "example.com".into(),
            issued_at: Instant::now(),
        }
    }

    #[test]
    fn stale_ids_do_not_alias_reused_slots() {
        let mut table = SessionTable::new();
        let first = table.insert("first");
        assert_eq!(table.teardown(first), vec!["first"]);

        let second = table.insert("second");
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"second"));
        assert_ne!(first, second);
    }

    #[test]
    fn bind_is_symmetric() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let destination = table.insert("destination");

        table.bind(client, destination).unwrap();
        assert!(table.is_symmetric());
        assert_eq!(table.lookup_destination(client), Some(destination));
        assert_eq!(table.lookup_client(destination), Some(client));
        assert_eq!(table.lookup_peer(destination), Some(client));
    }

    #[test]
    fn bind_rejects_second_destination() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let first = table.insert("d1");
        let second = table.insert("d2");

        table.bind(client, first).unwrap();
        assert_eq!(table.bind(client, second), Err(SessionError::AlreadyBound));
        assert!(table.is_symmetric());

        let gone = table.insert("gone");
        table.teardown(gone);
        assert_eq!(table.bind(gone, second), Err(SessionError::UnknownConnection));
    }

    #[test]
    fn unbind_by_client_closes_destination() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let destination = table.insert("destination");
        table.bind(client, destination).unwrap();

        assert_eq!(table.unbind_by_client(client), Some("destination"));
        assert!(table.is_symmetric());
        assert_eq!(table.lookup_destination(client), None);
        assert_eq!(table.lookup_client(destination), None);
        assert!(table.contains(client));
        assert!(!table.contains(destination));
    }

    #[test]
    fn unbind_by_destination_closes_client() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let destination = table.insert("destination");
        table.bind(client, destination).unwrap();

        assert_eq!(table.unbind_by_destination(destination), Some("client"));
        assert!(table.is_symmetric());
        assert!(!table.contains(client));
        assert!(table.contains(destination));
    }

    #[test]
    fn detach_keeps_both_sides() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let destination = table.insert("destination");
        table.bind(client, destination).unwrap();

        assert_eq!(table.detach(destination), Some(client));
        assert!(table.is_symmetric());
        assert_eq!(table.lookup_peer(client), None);
        assert!(table.contains(client));
        assert!(table.contains(destination));
        assert_eq!(table.detach(client), None);

        // A detached side no longer takes its old peer down with it
        assert_eq!(table.teardown(destination), vec!["destination"]);
        assert!(table.contains(client));
    }

    #[test]
    fn teardown_removes_both_sides() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let destination = table.insert("destination");
        let other = table.insert("other");
        table.bind(client, destination).unwrap();

        let mut closed = table.teardown(client);
        closed.sort();
        assert_eq!(closed, vec!["client", "destination"]);
        assert!(table.is_symmetric());
        assert_eq!(table.len(), 1);
        assert!(table.contains(other));

        let client = table.insert("client");
        let destination = table.insert("destination");
        table.bind(client, destination).unwrap();
        assert_eq!(table.teardown(destination).len(), 2);
        assert!(table.is_symmetric());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pending_dns_is_taken_once() {
        let mut table = SessionTable::new();
        let client = table.insert("client");

        table.register_pending_dns(7, pending(client)).unwrap();
        assert_eq!(
            table.register_pending_dns(7, pending(client)),
            Err(SessionError::DuplicateQuery(7))
        );
        assert!(table.has_pending_dns(7));

        let taken = table.take_pending_dns(7).unwrap();
        assert_eq!(taken.client, client);
        assert_eq!(taken.port, 80);
        assert_eq!(table.take_pending_dns(7), None);
    }

    #[test]
    fn teardown_forgets_pending_queries() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        let other = table.insert("other");
        table.register_pending_dns(1, pending(client)).unwrap();
        table.register_pending_dns(2, pending(other)).unwrap();

        table.teardown(client);
        assert!(!table.has_pending_dns(1));
        assert!(table.has_pending_dns(2));
        assert_eq!(table.pending_dns_count(), 1);
    }

    #[test]
    fn expired_queries_by_issue_time() {
        let mut table = SessionTable::new();
        let client = table.insert("client");
        table.register_pending_dns(3, pending(client)).unwrap();

        let before = table.pending_dns[&3].issued_at;
        assert!(table.expired_queries(before).is_empty());
        assert_eq!(
            table.expired_queries(before + std::time::Duration::from_millis(1)),
            vec![3]
        );
    }
}
