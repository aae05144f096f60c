//! Slab-backed doubly linked list.
//!
//! The eviction queue and the cache's holding lists need O(1) insertion
//! at the head, O(1) removal of the tail, and O(1) removal of an
//! arbitrary entry whose position was recorded when it was inserted.
//! Instead of intrusive pointers, nodes live in a slab (`Vec` of
//! optional nodes) and link to each other by index; vacated slots are
//! recycled through a free list. A [`SlotIdx`] is only meaningful to
//! the list that issued it and is invalidated by the removal that
//! consumes it.

/// Sentinel for "no node".
const NIL: u32 = u32::MAX;

/// Position of a node within the list that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotIdx(u32);

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: u32,
    next: u32,
}

/// Doubly linked list over a slab of recycled slots.
#[derive(Debug)]
pub(crate) struct SlotList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T> SlotList<T> {
    pub fn new() -> Self {
        SlotList {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, node: Node<T>) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            (self.slots.len() - 1) as u32
        }
    }

    /// Insert at the head (newest end).
    pub fn push_front(&mut self, value: T) -> SlotIdx {
        let idx = self.alloc(Node {
            value,
            prev: NIL,
            next: self.head,
        });
        if self.head != NIL {
            if let Some(node) = self.slots[self.head as usize].as_mut() {
                node.prev = idx;
            }
        } else {
            self.tail = idx;
        }
        self.head = idx;
        self.len += 1;
        SlotIdx(idx)
    }

    /// Insert at the tail (oldest end).
    pub fn push_back(&mut self, value: T) -> SlotIdx {
        let idx = self.alloc(Node {
            value,
            prev: self.tail,
            next: NIL,
        });
        if self.tail != NIL {
            if let Some(node) = self.slots[self.tail as usize].as_mut() {
                node.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
        SlotIdx(idx)
    }

    /// Remove the node at `idx`. Returns `None` if the slot is vacant,
    /// which indicates a stale index.
    pub fn remove(&mut self, idx: SlotIdx) -> Option<T> {
        let slot = idx.0 as usize;
        let node = self.slots.get_mut(slot)?.take()?;
        if node.prev != NIL {
            if let Some(prev) = self.slots[node.prev as usize].as_mut() {
                prev.next = node.next;
            }
        } else {
            self.head = node.next;
        }
        if node.next != NIL {
            if let Some(next) = self.slots[node.next as usize].as_mut() {
                next.prev = node.prev;
            }
        } else {
            self.tail = node.prev;
        }
        self.free.push(idx.0);
        self.len -= 1;
        Some(node.value)
    }

    /// Remove the oldest entry.
    pub fn pop_back(&mut self) -> Option<T> {
        if self.tail == NIL {
            None
        } else {
            self.remove(SlotIdx(self.tail))
        }
    }

    /// Remove the newest entry.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.head == NIL {
            None
        } else {
            self.remove(SlotIdx(self.head))
        }
    }

    pub fn back(&self) -> Option<&T> {
        self.slots
            .get(self.tail as usize)?
            .as_ref()
            .map(|n| &n.value)
    }

    pub fn front(&self) -> Option<&T> {
        self.slots
            .get(self.head as usize)?
            .as_ref()
            .map(|n| &n.value)
    }

    pub fn get(&self, idx: SlotIdx) -> Option<&T> {
        self.slots.get(idx.0 as usize)?.as_ref().map(|n| &n.value)
    }

    /// Head-to-tail iteration.
    pub fn iter(&self) -> SlotListIter<'_, T> {
        SlotListIter {
            list: self,
            cursor: self.head,
        }
    }
}

pub(crate) struct SlotListIter<'a, T> {
    list: &'a SlotList<T>,
    cursor: u32,
}

impl<'a, T> Iterator for SlotListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.list.slots[self.cursor as usize].as_ref()?;
        self.cursor = node.next;
        Some(&node.value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
