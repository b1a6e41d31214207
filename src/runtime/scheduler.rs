//! Round-robin order over the live coroutines.
//!
//! The cursor always names the running coroutine.
//! Registration appends to the order, so a fixed registration order and sequence of yields
//! always produces the same schedule.

/// Cyclic run order with a cursor that stays valid as entries come and go.
#[derive(Debug)]
pub(super) struct RoundRobin<K> {
    order: Vec<K>,
    cursor: usize,
}

impl<K: Copy + PartialEq> RoundRobin<K> {
    /// Starts with a single running entry.
    pub(super) fn new(running: K) -> Self {
        RoundRobin {
            order: vec![running],
            cursor: 0,
        }
    }

    /// Appends `key`, it runs after every entry registered before it.
    pub(super) fn register(&mut self, key: K) {
        debug_assert!(!self.order.contains(&key));
        self.order.push(key);
    }

    /// The running entry.
    pub(super) fn current(&self) -> K {
        self.order[self.cursor]
    }

    /// Moves the cursor to the next entry, wrapping around.
    pub(super) fn advance(&mut self) -> K {
        self.cursor = (self.cursor + 1) % self.order.len();
        self.current()
    }

    /// Removes `key` from the order.
    /// Removing the running entry moves the cursor onto its successor.
    ///
    /// # Panics
    /// If `key` isn't registered, or it's the last entry.
    pub(super) fn remove(&mut self, key: K) {
        let index = self
            .order
            .iter()
            .position(|k| *k == key)
            .expect("removing unregistered coroutine");
        assert!(self.order.len() > 1, "removing the last coroutine");

        self.order.remove(index);

        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor == self.order.len() {
            self.cursor = 0;
        }
    }

    pub(super) fn contains(&self, key: K) -> bool {
        self.order.contains(&key)
    }

    pub(super) fn len(&self) -> usize {
        self.order.len()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.order.iter().copied()
    }
}
