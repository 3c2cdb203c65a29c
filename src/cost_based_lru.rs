//! a [CostBasedLru] is an Lru cache which uses the cost of the items in the cache to decide when to evict.
//!
//! This is implemented as a vec-backed doubly linked list plus an auxiliary hash-based index from key to slot.  Freed
//! slots are chained together and reused before the vec grows.
//!
//! Values are handed out as `Arc`s, so evicting an entry never invalidates a bitmap somebody is still drawing.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

struct Node<K, V> {
    key: K,
    item: Arc<V>,
    cost: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot<K, V> {
    /// Free, possibly pointing at the next free slot.
    Free { next_free: Option<usize> },
    Used(Node<K, V>),
}

impl<K, V> Slot<K, V> {
    fn node(&self) -> &Node<K, V> {
        match self {
            Slot::Used(n) => n,
            Slot::Free { .. } => panic!("Slot should be in use"),
        }
    }

    fn node_mut(&mut self) -> &mut Node<K, V> {
        match self {
            Slot::Used(n) => n,
            Slot::Free { .. } => panic!("Slot should be in use"),
        }
    }
}

pub struct CostBasedLru<K: Hash + Eq, V> {
    slots: Vec<Slot<K, V>>,
    index: HashMap<K, usize, RandomState>,
    /// At what cost do we start evicting?
    max_cost: u64,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used; the next eviction victim.
    tail: Option<usize>,
    free_head: Option<usize>,
    current_cost: u64,
}

impl<K: Hash + Eq + Clone, V> CostBasedLru<K, V> {
    pub fn new(max_cost: u64) -> CostBasedLru<K, V> {
        CostBasedLru {
            slots: Vec::new(),
            index: HashMap::default(),
            max_cost,
            head: None,
            tail: None,
            free_head: None,
            current_cost: 0,
        }
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    pub fn current_cost(&self) -> u64 {
        self.current_cost
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn unlink(&mut self, ind: usize) {
        let (prev, next) = {
            let node = self.slots[ind].node();
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.slots[p].node_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].node_mut().prev = prev,
            None => self.tail = prev,
        }

        let node = self.slots[ind].node_mut();
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, ind: usize) {
        let old_head = self.head;
        {
            let node = self.slots[ind].node_mut();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].node_mut().prev = Some(ind);
        }
        self.head = Some(ind);
        if self.tail.is_none() {
            self.tail = Some(ind);
        }
    }

    /// Get an item, making it the most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ind = *self.index.get(key)?;
        self.unlink(ind);
        self.push_front(ind);
        Some(self.slots[ind].node().item.clone())
    }

    /// Get an item without touching its recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ind = *self.index.get(key)?;
        Some(self.slots[ind].node().item.clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    fn release(&mut self, ind: usize) -> Arc<V> {
        self.unlink(ind);
        let old = std::mem::replace(
            &mut self.slots[ind],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(ind);
        match old {
            Slot::Used(node) => {
                self.current_cost -= node.cost;
                node.item
            }
            Slot::Free { .. } => panic!("Should have been in use"),
        }
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ind = self.index.remove(key)?;
        Some(self.release(ind))
    }

    fn take_free_slot(&mut self) -> usize {
        if let Some(f) = self.free_head {
            self.free_head = match self.slots[f] {
                Slot::Free { next_free } => next_free,
                Slot::Used(_) => panic!("Free list points at a used slot"),
            };
            return f;
        }

        self.slots.push(Slot::Free { next_free: None });
        self.slots.len() - 1
    }

    /// Add an entry to the cache.  Return the old entry if this key was already present.
    ///
    /// An entry whose cost alone exceeds the maximum is evicted immediately.
    pub fn insert(&mut self, key: K, item: Arc<V>, cost: u64) -> Option<Arc<V>> {
        let ret = self.remove(&key);
        let ind = self.take_free_slot();
        self.slots[ind] = Slot::Used(Node {
            key: key.clone(),
            item,
            cost,
            prev: None,
            next: None,
        });
        self.push_front(ind);
        self.index.insert(key, ind);
        self.current_cost += cost;

        self.evict_to(self.max_cost);
        ret
    }

    fn evict_to(&mut self, target: u64) {
        while self.current_cost > target {
            let victim = match self.tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain cost"),
            };
            let key = self.slots[victim].node().key.clone();
            self.index.remove(&key);
            self.release(victim);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.free_head = None;
        self.current_cost = 0;
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.head;
        std::iter::from_fn(move || {
            let node = self.slots[ind?].node();
            ind = node.next;
            Some((&node.key, &*node.item))
        })
    }
}
