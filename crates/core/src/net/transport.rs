use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::stats::{LinkConditions, LinkRng, NetworkStats};

/// Message transport used by the replication engine.
///
/// Boundaries between messages are preserved, but delivery order and delivery
/// itself are not guaranteed. `receive` is drained once per tick; an empty
/// result is the normal case.
pub trait Transport {
    fn send(&mut self, payload: Vec<u8>);
    fn receive(&mut self) -> Vec<Vec<u8>>;
}

#[derive(Debug)]
struct InFlight {
    release_tick: u64,
    order: u64,
    payload: Vec<u8>,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.release_tick == other.release_tick && self.order == other.order
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_tick
            .cmp(&self.release_tick)
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug)]
struct Link {
    clock: u64,
    next_order: u64,
    in_flight: BinaryHeap<InFlight>,
    conditions: LinkConditions,
    rng: LinkRng,
    stats: NetworkStats,
}

impl Link {
    fn new(conditions: LinkConditions, rng: LinkRng) -> Self {
        Self {
            clock: 0,
            next_order: 0,
            in_flight: BinaryHeap::new(),
            conditions,
            rng,
            stats: NetworkStats::default(),
        }
    }

    fn push(&mut self, payload: Vec<u8>) {
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;

        if self.conditions.should_drop(&mut self.rng) {
            self.stats.messages_dropped += 1;
            return;
        }

        if self.conditions.should_duplicate(&mut self.rng) {
            self.stats.messages_duplicated += 1;
            self.enqueue(payload.clone());
        }
        self.enqueue(payload);
    }

    fn enqueue(&mut self, payload: Vec<u8>) {
        let delay = u64::from(self.conditions.delay_ticks(&mut self.rng));
        let order = self.next_order;
        self.next_order += 1;
        self.in_flight.push(InFlight {
            release_tick: self.clock + delay,
            order,
            payload,
        });
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.clock += 1;
        let mut delivered = Vec::new();
        while self
            .in_flight
            .peek()
            .is_some_and(|m| m.release_tick < self.clock)
        {
            if let Some(message) = self.in_flight.pop() {
                self.stats.messages_received += 1;
                self.stats.bytes_received += message.payload.len() as u64;
                delivered.push(message.payload);
            }
        }
        delivered
    }
}

/// One end of an in-memory link. Each direction is simulated independently,
/// so loss and delay can differ between upstream and downstream.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    outgoing: Arc<Mutex<Link>>,
    incoming: Arc<Mutex<Link>>,
}

impl LoopbackTransport {
    pub fn pair(conditions: LinkConditions, seed: u64) -> (Self, Self) {
        Self::asymmetric_pair(conditions.clone(), conditions, seed)
    }

    /// Returns `(a, b)` where `a_to_b` applies to messages sent by `a`.
    pub fn asymmetric_pair(
        a_to_b: LinkConditions,
        b_to_a: LinkConditions,
        seed: u64,
    ) -> (Self, Self) {
        let forward = Arc::new(Mutex::new(Link::new(a_to_b, LinkRng::new(seed))));
        let backward = Arc::new(Mutex::new(Link::new(
            b_to_a,
            LinkRng::new(seed.wrapping_mul(31).wrapping_add(17)),
        )));

        (
            Self {
                outgoing: Arc::clone(&forward),
                incoming: Arc::clone(&backward),
            },
            Self {
                outgoing: backward,
                incoming: forward,
            },
        )
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        lock(&self.outgoing).conditions = conditions;
    }

    /// Counters for messages sent from this end.
    pub fn sent_stats(&self) -> NetworkStats {
        lock(&self.outgoing).stats.clone()
    }

    /// Counters for messages delivered to this end.
    pub fn received_stats(&self) -> NetworkStats {
        lock(&self.incoming).stats.clone()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.outgoing).in_flight.len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, payload: Vec<u8>) {
        lock(&self.outgoing).push(payload);
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        lock(&self.incoming).drain()
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}
