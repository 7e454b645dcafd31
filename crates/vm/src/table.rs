//! The hashed associative array used by the VM.
//!
//! A table is a dense array part indexed from 1 plus a chained hash part.
//! Deleted hash keys leave a tombstone (a live key with a nil value) so that
//! an iteration in progress keeps its position. An optional iteration-order
//! vector, installed when a table is deserialized, pins the externally
//! observable `next` order even though handle-derived hash buckets differ
//! from the serializing VM. The vector is dropped as soon as the table's key
//! set changes; in-place updates of existing keys keep it.

use crate::error::{VmError, VmResult};
use crate::value::{TableRef, Value};

/// One slot of the hash part. `next` chains colliding keys; -1 terminates.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub key: Value,
    pub value: Value,
    pub next: i32,
}

impl Node {
    fn empty() -> Self {
        Node {
            key: Value::Nil,
            value: Value::Nil,
            next: -1,
        }
    }

    fn is_free(&self) -> bool {
        self.key.is_nil()
    }

    fn is_tombstone(&self) -> bool {
        !self.key.is_nil() && self.value.is_nil()
    }
}

/// A table: array part, hash part, and optional pinned iteration order.
#[derive(Debug, Clone, Default)]
pub struct Table {
    array: Vec<Value>,
    nodes: Vec<Node>,
    /// Scan position for free-node allocation; only rehash resets it.
    last_free: usize,
    /// Pinned external iteration order: entries index the combined
    /// (array + hash) address space, -1 marks a preserved nil hole.
    iter_order: Option<Vec<i32>>,
    /// Rejects all mutation when set.
    pub readonly: bool,
    /// Marks a globals table that is known to hold only trusted bindings.
    pub safe_env: bool,
    /// Table consulted on missed lookups; one hop only, used for the
    /// instance-globals to base-image-globals chain.
    pub fallback: Option<TableRef>,
}

impl Table {
    /// Creates an empty table.
    pub fn new() -> Self {
        Table::default()
    }

    /// Creates a table with preallocated parts. The node count rounds up to
    /// a power of two.
    pub fn with_capacity(narray: usize, nnodes: usize) -> Self {
        let node_cap = if nnodes == 0 {
            0
        } else {
            nnodes.next_power_of_two()
        };
        Table {
            array: vec![Value::Nil; narray],
            nodes: vec![Node::empty(); node_cap],
            last_free: node_cap,
            ..Table::default()
        }
    }

    /// Returns the length of the array part.
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Returns the capacity of the hash part.
    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when an iteration-order vector is pinned.
    pub fn has_pinned_order(&self) -> bool {
        self.iter_order.is_some()
    }

    /// Approximate byte footprint, used for per-category accounting.
    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.capacity() * std::mem::size_of::<Value>()
            + self.nodes.capacity() * std::mem::size_of::<Node>()
            + self
                .iter_order
                .as_ref()
                .map(|v| v.capacity() * std::mem::size_of::<i32>())
                .unwrap_or(0)
    }

    fn check_key(key: &Value) -> VmResult<()> {
        match key {
            Value::Nil => Err(VmError::runtime("table index is nil")),
            Value::Number(n) if n.is_nan() => Err(VmError::runtime("table index is NaN")),
            Value::Vector(v) if v.iter().any(|c| c.is_nan()) => {
                Err(VmError::runtime("table index is NaN"))
            }
            _ => Ok(()),
        }
    }

    fn normalize_key(key: Value) -> Value {
        match key {
            Value::Number(n) if n == 0.0 => Value::Number(0.0),
            other => other,
        }
    }

    /// Reads a value. Missing keys (including nil and NaN) read as nil; the
    /// fallback table is not consulted here.
    pub fn get(&self, key: Value) -> Value {
        if let Some(i) = key.as_array_index() {
            let i = i as usize;
            if i <= self.array.len() {
                return self.array[i - 1];
            }
        }
        if Table::check_key(&key).is_err() {
            return Value::Nil;
        }
        let key = Table::normalize_key(key);
        match self.find_node(&key) {
            Some(slot) => self.nodes[slot].value,
            None => Value::Nil,
        }
    }

    /// Writes a value, applying the order-invalidation rules: inserting a
    /// new key or deleting an existing one drops the pinned order, updating
    /// an existing key in place keeps it.
    pub fn set(&mut self, key: Value, value: Value) -> VmResult<()> {
        if self.readonly {
            return Err(VmError::runtime("attempt to modify a readonly table"));
        }
        Table::check_key(&key)?;
        let key = Table::normalize_key(key);

        if let Some(i) = key.as_array_index() {
            let i = i as usize;
            if i <= self.array.len() {
                let old = self.array[i - 1];
                if old.is_nil() != value.is_nil() {
                    self.iter_order = None;
                }
                self.array[i - 1] = value;
                return Ok(());
            }
        }

        if let Some(slot) = self.find_node(&key) {
            let old = self.nodes[slot].value;
            if old.is_nil() != value.is_nil() {
                self.iter_order = None;
            }
            self.nodes[slot].value = value;
            return Ok(());
        }

        // Absent key: writing nil is a no-op and does not disturb the order.
        if value.is_nil() {
            return Ok(());
        }

        self.iter_order = None;
        self.new_key(key, value);
        Ok(())
    }

    fn main_position(&self, key: &Value) -> usize {
        debug_assert!(!self.nodes.is_empty());
        (key.raw_hash() % self.nodes.len() as u64) as usize
    }

    fn find_node(&self, key: &Value) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut slot = self.main_position(key) as i32;
        loop {
            let node = &self.nodes[slot as usize];
            if !node.is_free() && node.key == *key {
                return Some(slot as usize);
            }
            slot = node.next;
            if slot < 0 {
                return None;
            }
        }
    }

    fn free_node(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].is_free() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Inserts a key known to be absent from both parts.
    fn new_key(&mut self, key: Value, value: Value) {
        if self.nodes.is_empty() {
            self.rehash(Some(&key));
            self.place_after_rehash(key, value);
            return;
        }
        let mp = self.main_position(&key);
        if self.nodes[mp].is_free() {
            self.nodes[mp] = Node {
                key,
                value,
                next: -1,
            };
            return;
        }

        let free = match self.free_node() {
            Some(slot) => slot,
            None => {
                self.rehash(Some(&key));
                self.place_after_rehash(key, value);
                return;
            }
        };

        let colliding_key = self.nodes[mp].key;
        let colliding_main = self.main_position(&colliding_key);
        if colliding_main != mp {
            // The occupant is a chained collider; move it out and take its
            // main position.
            let mut prev = colliding_main;
            while self.nodes[prev].next != mp as i32 {
                prev = self.nodes[prev].next as usize;
            }
            self.nodes[prev].next = free as i32;
            self.nodes[free] = self.nodes[mp];
            self.nodes[mp] = Node {
                key,
                value,
                next: -1,
            };
        } else {
            // The occupant owns this position; chain the new key behind it.
            self.nodes[free] = Node {
                key,
                value,
                next: self.nodes[mp].next,
            };
            self.nodes[mp].next = free as i32;
        }
    }

    /// Re-dispatches an insert after a rehash, which may have moved the
    /// key's home into the array part.
    fn place_after_rehash(&mut self, key: Value, value: Value) {
        if let Some(i) = key.as_array_index() {
            let i = i as usize;
            if i <= self.array.len() {
                self.array[i - 1] = value;
                return;
            }
        }
        self.new_key(key, value);
    }

    /// Rebuilds both parts from the live entries, sizing the array part so
    /// that more than half of its slots are used (counting `pending`, the
    /// key whose insertion triggered the rebuild). Tombstones are dropped,
    /// which is why a rebuild is only reachable from paths that have already
    /// invalidated the pinned order.
    fn rehash(&mut self, pending: Option<&Value>) {
        debug_assert!(self.iter_order.is_none());

        let mut pairs: Vec<(Value, Value)> = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                pairs.push((Value::Number((i + 1) as f64), *v));
            }
        }
        for node in &self.nodes {
            if !node.is_free() && !node.value.is_nil() {
                pairs.push((node.key, node.value));
            }
        }

        // Count integral keys per power-of-two range: bucket k holds keys
        // in (2^(k-1), 2^k].
        let mut counts = [0usize; 33];
        let mut int_total = 0usize;
        let mut count_key = |key: &Value| {
            if let Some(i) = key.as_array_index() {
                let log = if i == 1 {
                    0
                } else {
                    (32 - (i - 1).leading_zeros()) as usize
                };
                counts[log] += 1;
                int_total += 1;
            }
        };
        for (k, _) in &pairs {
            count_key(k);
        }
        if let Some(p) = pending {
            count_key(p);
        }

        // Largest power of two n with more than half of 1..=n populated.
        let mut best_size = 0usize;
        let mut running = 0usize;
        let mut covered = 0usize;
        for (log, count) in counts.iter().enumerate() {
            running += count;
            let size = 1usize << log;
            if running > size / 2 {
                best_size = size;
                covered = running;
            }
            if running == int_total {
                break;
            }
        }

        let hash_count = pairs.len() + pending.map(|_| 1).unwrap_or(0) - covered;
        let node_cap = if hash_count == 0 {
            0
        } else {
            hash_count.next_power_of_two()
        };

        self.array = vec![Value::Nil; best_size];
        self.nodes = vec![Node::empty(); node_cap];
        self.last_free = node_cap;

        for (k, v) in pairs {
            if let Some(i) = k.as_array_index() {
                let i = i as usize;
                if i <= self.array.len() {
                    self.array[i - 1] = v;
                    continue;
                }
            }
            self.new_key(k, v);
        }
    }

    /// The border used by the length operator: an `n` where `t[n]` is
    /// non-nil and `t[n+1]` is nil, found by binary search.
    pub fn length(&self) -> usize {
        let alen = self.array.len();
        if alen > 0 && self.array[alen - 1].is_nil() {
            let mut lo = 0usize;
            let mut hi = alen;
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.nodes.is_empty() {
            return alen;
        }
        // Array part is full; probe the hash part by doubling, then narrow.
        let mut i = alen;
        let mut j = alen + 1;
        while !self.get(Value::Number(j as f64)).is_nil() {
            i = j;
            match j.checked_mul(2) {
                Some(next) => j = next,
                None => {
                    // Pathological key range; fall back to a linear scan.
                    let mut n = i;
                    while !self.get(Value::Number((n + 1) as f64)).is_nil() {
                        n += 1;
                    }
                    return n;
                }
            }
        }
        while j - i > 1 {
            let mid = (i + j) / 2;
            if self.get(Value::Number(mid as f64)).is_nil() {
                j = mid;
            } else {
                i = mid;
            }
        }
        i
    }

    // ---- iteration ----------------------------------------------------

    /// Number of positions in the external iteration sequence.
    pub fn seq_len(&self) -> usize {
        match &self.iter_order {
            Some(order) => order.len(),
            None => self.array.len() + self.nodes.len(),
        }
    }

    /// Resolves a sequence position to a combined-address-space slot.
    fn combined_at(&self, pos: usize) -> Option<usize> {
        match &self.iter_order {
            Some(order) => {
                let entry = order[pos];
                if entry < 0 {
                    None
                } else {
                    Some(entry as usize)
                }
            }
            None => Some(pos),
        }
    }

    fn slot_entry(&self, combined: usize) -> (Value, Value) {
        if combined < self.array.len() {
            (
                Value::Number((combined + 1) as f64),
                self.array[combined],
            )
        } else {
            let node = &self.nodes[combined - self.array.len()];
            (node.key, node.value)
        }
    }

    /// Returns the first live entry at sequence position `pos` or later, as
    /// `(position, key, value)`.
    pub fn iter_from(&self, pos: usize) -> Option<(usize, Value, Value)> {
        for p in pos..self.seq_len() {
            if let Some(combined) = self.combined_at(p) {
                let (key, value) = self.slot_entry(combined);
                if !value.is_nil() {
                    return Some((p, key, value));
                }
            }
        }
        None
    }

    /// Finds the combined slot of a live key.
    fn find_live_slot(&self, key: &Value) -> Option<usize> {
        if let Some(i) = key.as_array_index() {
            let i = i as usize;
            if i <= self.array.len() {
                return if self.array[i - 1].is_nil() {
                    None
                } else {
                    Some(i - 1)
                };
            }
        }
        match self.find_node(key) {
            Some(slot) if !self.nodes[slot].is_tombstone() => Some(self.array.len() + slot),
            _ => None,
        }
    }

    /// The `next` operation: returns the entry following `key`, or the
    /// first entry when `key` is nil. A key that is not currently live —
    /// never present, or explicitly nil-ed — is rejected.
    pub fn next_after(&self, key: Value) -> VmResult<Option<(Value, Value)>> {
        if key.is_nil() {
            return Ok(self.iter_from(0).map(|(_, k, v)| (k, v)));
        }
        let key = Table::normalize_key(key);
        let combined = self
            .find_live_slot(&key)
            .ok_or_else(|| VmError::runtime("invalid key to iteration"))?;
        let pos = match &self.iter_order {
            Some(order) => order
                .iter()
                .position(|&entry| entry == combined as i32)
                .ok_or_else(|| VmError::runtime("invalid key to iteration"))?,
            None => combined,
        };
        Ok(self.iter_from(pos + 1).map(|(_, k, v)| (k, v)))
    }

    // ---- persistence support ------------------------------------------

    /// The array part, nils included.
    pub(crate) fn array_part(&self) -> &[Value] {
        &self.array
    }

    /// Slots of live hash entries, in slot order.
    pub(crate) fn live_node_slots(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&s| !self.nodes[s].is_free() && !self.nodes[s].value.is_nil())
            .collect()
    }

    /// Key/value of a hash slot.
    pub(crate) fn node_entry(&self, slot: usize) -> (Value, Value) {
        (self.nodes[slot].key, self.nodes[slot].value)
    }

    /// Renders the external iteration sequence for serialization: one entry
    /// per position, -1 for nil holes, live hash entries renumbered to
    /// `array_len + rank` where rank is the position among live slots. The
    /// deserializing side re-inserts live entries in rank order, so rank is
    /// the only node identity that survives the trip.
    pub(crate) fn serialized_iteration(&self) -> Vec<i32> {
        let live = self.live_node_slots();
        let mut rank = vec![-1i32; self.nodes.len()];
        for (r, &slot) in live.iter().enumerate() {
            rank[slot] = r as i32;
        }
        (0..self.seq_len())
            .map(|pos| match self.combined_at(pos) {
                None => -1,
                Some(c) if c < self.array.len() => {
                    if self.array[c].is_nil() {
                        -1
                    } else {
                        c as i32
                    }
                }
                Some(c) => {
                    let slot_rank = rank[c - self.array.len()];
                    if slot_rank < 0 {
                        -1
                    } else {
                        self.array.len() as i32 + slot_rank
                    }
                }
            })
            .collect()
    }

    /// Rebuilds a table from its serialized parts. `pairs` are the live hash
    /// entries in rank order; `order` entries above the array part refer to
    /// ranks and are rebound to the slots the re-insertion actually chose.
    /// Part sizes are taken as-is — they regain power-of-two shape at the
    /// next rehash.
    pub(crate) fn from_parts(
        array: Vec<Value>,
        node_capacity: usize,
        pairs: Vec<(Value, Value)>,
        order: Option<Vec<i32>>,
        readonly: bool,
        safe_env: bool,
        fallback: Option<TableRef>,
    ) -> VmResult<Table> {
        if pairs.len() > node_capacity {
            return Err(VmError::restore("table node count exceeds capacity"));
        }
        let array_len = array.len();
        let mut table = Table {
            array,
            nodes: vec![Node::empty(); node_capacity],
            last_free: node_capacity,
            iter_order: None,
            readonly: false,
            safe_env,
            fallback,
        };
        let mut slot_of_rank = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            Table::check_key(&key).map_err(|_| VmError::restore("invalid table key in stream"))?;
            if value.is_nil() {
                return Err(VmError::restore("nil value in table hash entries"));
            }
            let key = Table::normalize_key(key);
            if table.find_node(&key).is_some() || {
                // Keys that land in the array part must not also appear as
                // hash entries.
                key.as_array_index()
                    .map(|i| (i as usize) <= array_len)
                    .unwrap_or(false)
            } {
                return Err(VmError::restore("duplicate table key in stream"));
            }
            table.new_key(key, value);
            let slot = table
                .find_node(&key)
                .ok_or_else(|| VmError::internal("inserted key not found"))?;
            slot_of_rank.push(slot);
        }
        if let Some(order) = order {
            let mut rebound = Vec::with_capacity(order.len());
            for entry in order {
                if entry < 0 {
                    rebound.push(-1);
                } else if (entry as usize) < array_len {
                    rebound.push(entry);
                } else {
                    let rank = entry as usize - array_len;
                    let slot = *slot_of_rank
                        .get(rank)
                        .ok_or_else(|| VmError::restore("iteration order rank out of range"))?;
                    rebound.push((array_len + slot) as i32);
                }
            }
            if rebound.len() != table.array.len() + table.nodes.len() {
                return Err(VmError::restore("iteration order length mismatch"));
            }
            table.iter_order = Some(rebound);
        }
        table.readonly = readonly;
        Ok(table)
    }

    /// Values referenced by this table, for the collector's traversal.
    pub(crate) fn referenced_values(&self) -> impl Iterator<Item = Value> + '_ {
        let fallback = self.fallback.map(Value::Table);
        self.array
            .iter()
            .copied()
            .chain(
                self.nodes
                    .iter()
                    .flat_map(|n| [n.key, n.value].into_iter()),
            )
            .chain(fallback.into_iter())
    }
}
