use std::collections::HashMap;
use std::net::SocketAddrV4;

use bitvec::order::Msb0;
use bitvec::slice::BitSlice;
use rand::seq::SliceRandom;
use rand::Rng;

/// Pieces that currently have a request in flight, together with the connection that owns each
/// request. A piece index is present at most once, so at most one peer is ever asked for it.
#[derive(Debug, Default)]
pub struct RequestQueue {
    in_flight: HashMap<u32, SocketAddrV4>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the piece is already requested from someone
    pub fn add(&mut self, index: u32, owner: SocketAddrV4) -> bool {
        match self.in_flight.entry(index) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(owner);
                true
            }
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<SocketAddrV4> {
        self.in_flight.remove(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.in_flight.contains_key(&index)
    }

    pub fn owner(&self, index: u32) -> Option<SocketAddrV4> {
        self.in_flight.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Drops every request owned by a connection that went away, so other peers can pick them up
    pub fn release_owned_by(&mut self, owner: SocketAddrV4) -> Vec<u32> {
        let mut released = Vec::new();
        self.in_flight.retain(|index, peer| {
            if *peer == owner {
                released.push(*index);
                false
            } else {
                true
            }
        });
        released.sort_unstable();
        released
    }
}

/// Pieces that we don't have yet and the remote peer does
pub fn wanted_pieces(have: &BitSlice<u8, Msb0>, remote: &BitSlice<u8, Msb0>) -> Vec<u32> {
    have.iter()
        .by_vals()
        .zip(remote.iter().by_vals())
        .enumerate()
        .filter(|(_, (have, available))| !*have && *available)
        .map(|(idx, _)| idx as u32)
        .collect()
}

/// Picks one of the wanted pieces that nobody is downloading yet, uniformly at random
pub fn pick_next_piece<R: Rng + ?Sized>(
    have: &BitSlice<u8, Msb0>,
    remote: &BitSlice<u8, Msb0>,
    queue: &RequestQueue,
    rng: &mut R,
) -> Option<u32> {
    let candidates = wanted_pieces(have, remote)
        .into_iter()
        .filter(|index| !queue.contains(*index))
        .collect::<Vec<u32>>();

    candidates.choose(rng).copied()
}
