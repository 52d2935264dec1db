//! A window over a serially-numbered sequence, dropping items from the front
//! as they complete.
//!
//! Serials below the window start are done and gone; serials inside the
//! window may or may not hold an item; serials past the end have not been
//! produced yet.

use std::collections::VecDeque;

/// Sliding window keyed by `u32` serials.
#[derive(Debug)]
pub struct SlidingList<T> {
    start: u32,
    items: VecDeque<Option<T>>,
}

impl<T> SlidingList<T> {
    /// Creates an empty window starting at serial 0.
    pub fn new() -> Self {
        Self {
            start: 0,
            items: VecDeque::new(),
        }
    }

    /// First serial still inside the window.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// One past the last serial the window covers.
    pub fn end(&self) -> u32 {
        self.start + self.items.len() as u32
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    /// Appends an item at the current end, returning its serial.
    pub fn push(&mut self, item: T) -> u32 {
        let serial = self.end();
        self.items.push_back(Some(item));
        serial
    }

    /// Inserts an item at a serial at or past the window end, growing the
    /// window with empty slots as needed. Returns `false` if the serial is
    /// below the window start or already occupied.
    pub fn insert(&mut self, serial: u32, item: T) -> bool {
        if serial < self.start {
            return false;
        }
        let offset = (serial - self.start) as usize;
        while self.items.len() <= offset {
            self.items.push_back(None);
        }
        if self.items[offset].is_some() {
            return false;
        }
        self.items[offset] = Some(item);
        true
    }

    /// Borrows the item at a serial, if the window still holds one there.
    pub fn get(&self, serial: u32) -> Option<&T> {
        if serial < self.start {
            return None;
        }
        self.items
            .get((serial - self.start) as usize)
            .and_then(|slot| slot.as_ref())
    }

    /// Mutably borrows the item at a serial.
    pub fn get_mut(&mut self, serial: u32) -> Option<&mut T> {
        if serial < self.start {
            return None;
        }
        self.items
            .get_mut((serial - self.start) as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Removes the item at a serial, leaving an empty slot.
    pub fn take(&mut self, serial: u32) -> Option<T> {
        if serial < self.start {
            return None;
        }
        self.items
            .get_mut((serial - self.start) as usize)
            .and_then(|slot| slot.take())
    }

    /// Advances the window start past leading empty slots, returning the new
    /// start serial.
    pub fn advance(&mut self) -> u32 {
        while matches!(self.items.front(), Some(None)) {
            self.items.pop_front();
            self.start += 1;
        }
        self.start
    }

    /// Iterates occupied slots as `(serial, item)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(offset, slot)| slot.as_ref().map(|item| (self.start + offset as u32, item)))
    }

    /// Iterates occupied slots mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        let start = self.start;
        self.items
            .iter_mut()
            .enumerate()
            .filter_map(move |(offset, slot)| slot.as_mut().map(|item| (start + offset as u32, item)))
    }

    /// Whether no occupied slot remains.
    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|slot| slot.is_none())
    }
}

impl<T> Default for SlidingList<T> {
    fn default() -> Self {
        Self::new()
    }
}
