//! Waypoints and the plane registry.
//!
//! A waypoint anchors one document snapshot to the journal timeline: which
//! plane the in-memory state is on, which plane the next save will land on,
//! the snapshot's content hash, and the journal position at save time.
//! Planes are globally unique non-zero random identifiers; the registry is
//! the only minting authority.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The versioning triple plus journal anchor for one document snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Waypoint {
    /// Journal position at the time of the save.
    pub journal_position: u64,
    /// Plane the current in-memory state belongs to. Non-zero once prepared.
    pub current_plane: u32,
    /// Plane the next save will promote to current. Non-zero once prepared.
    pub next_plane: u32,
    /// 64-bit content hash of the serialized document.
    pub hash: u64,
}

impl Waypoint {
    /// Whether this waypoint has registered planes.
    pub fn is_valid(&self) -> bool {
        self.current_plane != 0 && self.next_plane != 0
    }
}

/// Registry of live plane ids, shared by every document in a process.
///
/// Collision-and-retry on a 32-bit space is the uniqueness strategy; the
/// registry never hands out zero and never hands out a live plane twice.
#[derive(Default)]
pub struct PlaneRegistry {
    planes: Mutex<HashMap<u32, u64>>,
}

impl PlaneRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh unique non-zero plane registered to `owner`.
    pub fn mint(&self, owner: u64) -> u32 {
        let mut planes = self.planes.lock();
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 && !planes.contains_key(&candidate) {
                planes.insert(candidate, owner);
                return candidate;
            }
        }
    }

    /// Releases a plane. Releasing zero or an unknown plane is a no-op.
    pub fn release(&self, plane: u32) {
        if plane != 0 {
            self.planes.lock().remove(&plane);
        }
    }

    /// Looks up the owner of a plane.
    pub fn owner(&self, plane: u32) -> Option<u64> {
        self.planes.lock().get(&plane).copied()
    }

    /// Initializes a waypoint's planes if they are not yet registered.
    /// Existing non-zero planes (from a loaded snapshot) are re-registered
    /// as-is.
    pub fn adopt(&self, waypoint: &mut Waypoint, owner: u64) {
        let mut planes = self.planes.lock();
        let mut rng = rand::thread_rng();
        for plane in [&mut waypoint.current_plane, &mut waypoint.next_plane] {
            if *plane != 0 {
                planes.insert(*plane, owner);
                continue;
            }
            loop {
                let candidate: u32 = rng.gen();
                if candidate != 0 && !planes.contains_key(&candidate) {
                    planes.insert(candidate, owner);
                    *plane = candidate;
                    break;
                }
            }
        }
    }

    /// Advances a waypoint after a successful save: retires the old current
    /// plane, promotes next to current, and mints a fresh next plane.
    pub fn advance(&self, waypoint: &Waypoint, owner: u64, hash: u64, journal_position: u64) -> Waypoint {
        self.release(waypoint.current_plane);
        let next = self.mint(owner);
        Waypoint {
            journal_position,
            current_plane: waypoint.next_plane,
            next_plane: next,
            hash,
        }
    }

    /// Releases both planes of a waypoint.
    pub fn retire(&self, waypoint: &Waypoint) {
        self.release(waypoint.current_plane);
        self.release(waypoint.next_plane);
    }

    /// Number of live planes.
    pub fn len(&self) -> usize {
        self.planes.lock().len()
    }

    /// Whether no planes are live.
    pub fn is_empty(&self) -> bool {
        self.planes.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_unique_non_zero() {
        let registry = PlaneRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let plane = registry.mint(1);
            assert_ne!(plane, 0);
            assert!(seen.insert(plane));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_release() {
        let registry = PlaneRegistry::new();
        let plane = registry.mint(7);
        assert_eq!(registry.owner(plane), Some(7));
        registry.release(plane);
        assert_eq!(registry.owner(plane), None);
        registry.release(0); // no-op
    }

    #[test]
    fn test_adopt_fills_zero_planes() {
        let registry = PlaneRegistry::new();
        let mut waypoint = Waypoint::default();
        assert!(!waypoint.is_valid());
        registry.adopt(&mut waypoint, 3);
        assert!(waypoint.is_valid());
        assert_ne!(waypoint.current_plane, waypoint.next_plane);
        assert_eq!(registry.owner(waypoint.current_plane), Some(3));
    }

    #[test]
    fn test_adopt_keeps_existing_planes() {
        let registry = PlaneRegistry::new();
        let mut waypoint = Waypoint {
            journal_position: 5,
            current_plane: 11,
            next_plane: 22,
            hash: 0,
        };
        registry.adopt(&mut waypoint, 1);
        assert_eq!(waypoint.current_plane, 11);
        assert_eq!(waypoint.next_plane, 22);
        assert_eq!(registry.owner(11), Some(1));
    }

    #[test]
    fn test_advance_rotates_planes() {
        let registry = PlaneRegistry::new();
        let mut waypoint = Waypoint::default();
        registry.adopt(&mut waypoint, 1);
        let old_current = waypoint.current_plane;
        let old_next = waypoint.next_plane;

        let advanced = registry.advance(&waypoint, 1, 0xABCD, 42);
        assert_eq!(advanced.current_plane, old_next);
        assert_ne!(advanced.next_plane, 0);
        assert_ne!(advanced.next_plane, old_next);
        assert_eq!(advanced.hash, 0xABCD);
        assert_eq!(advanced.journal_position, 42);
        // the retired plane is gone from the registry
        assert_eq!(registry.owner(old_current), None);
    }

    #[test]
    fn test_advance_sequence_planes_distinct() {
        let registry = PlaneRegistry::new();
        let mut waypoint = Waypoint::default();
        registry.adopt(&mut waypoint, 1);
        let mut currents = std::collections::HashSet::new();
        for i in 0..50u64 {
            waypoint = registry.advance(&waypoint, 1, i, i);
            assert_ne!(waypoint.current_plane, 0);
            assert!(currents.insert(waypoint.current_plane));
        }
    }

    #[test]
    fn test_retire() {
        let registry = PlaneRegistry::new();
        let mut waypoint = Waypoint::default();
        registry.adopt(&mut waypoint, 1);
        registry.retire(&waypoint);
        assert!(registry.is_empty());
    }
}
