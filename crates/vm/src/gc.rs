//! Incremental tri-colour collector.
//!
//! Work is metered in bytes: allocations accumulate debt, and each step
//! performs `debt * step_multiplier%` worth of marking or sweeping before
//! returning control. A cycle is mark → atomic re-scan → sweep. Threads are
//! re-scanned at the atomic step because stack slots are written without
//! barriers; all other parent-to-child stores go through
//! [`Heap::write_barrier`].
//!
//! Fixed objects are traversed but never reclaimed. A pause guard
//! (`gc_pause`/`gc_unpause`) holds the collector still while the
//! persistence subsystem walks the graph.
//!
//! [`Heap::write_barrier`]: crate::heap::Heap::write_barrier

use crate::config::VmConfig;
use crate::heap::{GcColor, GcRef, Heap};
use crate::value::{StringRef, ThreadRef};

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcPhase {
    Idle,
    Mark,
    /// Sweeping arena `arena` from slot `cursor`.
    Sweep { arena: u8, cursor: usize },
}

/// Collector bookkeeping, owned by the heap.
pub(crate) struct GcState {
    pub phase: GcPhase,
    /// Current white parity; flipped at the atomic step.
    pub white: bool,
    pub gray: Vec<GcRef>,
    /// Bytes allocated since the last completed step.
    pub debt: usize,
    /// Non-zero while a scoped guard forbids collection.
    pub pause_depth: u32,
    /// Total-bytes level that starts the next cycle.
    pub threshold: usize,
    pub goal_percent: u32,
    pub step_multiplier: u32,
    pub step_size: usize,
    /// Cycles completed, for logging.
    pub cycle_count: u64,
}

impl GcState {
    pub(crate) fn new(config: &VmConfig) -> Self {
        GcState {
            phase: GcPhase::Idle,
            white: false,
            gray: Vec::new(),
            debt: 0,
            pause_depth: 0,
            threshold: 64 * 1024,
            goal_percent: config.gc_goal_percent,
            step_multiplier: config.gc_step_multiplier,
            step_size: config.gc_step_size,
            cycle_count: 0,
        }
    }
}

const ARENA_COUNT: u8 = 8;

impl Heap {
    /// Whether enough debt has accumulated to warrant a step.
    pub fn gc_should_step(&self) -> bool {
        self.gc.pause_depth == 0
            && (self.gc.debt >= self.gc.step_size
                || (self.gc.phase == GcPhase::Idle && self.total_bytes() >= self.gc.threshold))
    }

    /// Forbids collection until the matching [`gc_unpause`].
    ///
    /// [`gc_unpause`]: Heap::gc_unpause
    pub fn gc_pause(&mut self) {
        self.gc.pause_depth += 1;
    }

    /// Releases one pause level.
    pub fn gc_unpause(&mut self) {
        debug_assert!(self.gc.pause_depth > 0, "unbalanced gc_unpause");
        self.gc.pause_depth = self.gc.pause_depth.saturating_sub(1);
    }

    /// Performs one bounded increment of collection work.
    pub fn gc_step(&mut self) {
        if self.gc.pause_depth > 0 {
            return;
        }
        let mut budget =
            (self.gc.debt.max(self.gc.step_size) / 100) * self.gc.step_multiplier as usize;
        self.gc.debt = 0;

        while budget > 0 {
            match self.gc.phase {
                GcPhase::Idle => {
                    if self.total_bytes() < self.gc.threshold {
                        return;
                    }
                    self.begin_mark();
                }
                GcPhase::Mark => {
                    if let Some(r) = self.gc.gray.pop() {
                        budget = budget.saturating_sub(self.mark_object(r).max(16));
                    } else {
                        self.atomic_remark();
                        self.gc.white = !self.gc.white;
                        self.gc.phase = GcPhase::Sweep {
                            arena: 0,
                            cursor: 0,
                        };
                    }
                }
                GcPhase::Sweep { arena, cursor } => {
                    let (next, freed) = self.sweep_increment(arena, cursor, &mut budget);
                    match next {
                        Some((arena, cursor)) => {
                            self.gc.phase = GcPhase::Sweep { arena, cursor };
                        }
                        None => {
                            self.finish_cycle(freed);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Runs a complete collection cycle to quiescence. Callers must hold
    /// no unrooted handles across this; the engine only calls it at
    /// safepoints.
    pub fn collect_full(&mut self) {
        self.note_safepoint();
        self.collect_full_keeping_recent();
    }

    /// Full cycle that keeps recent allocations pinned; the emergency path
    /// inside `charge` runs mid-allocation, where native locals may hold
    /// objects nothing else references yet.
    pub(crate) fn collect_full_keeping_recent(&mut self) {
        if self.gc.pause_depth > 0 {
            return;
        }
        // Finish any in-flight cycle first, then run one from a clean start.
        self.run_to_idle();
        self.begin_mark();
        self.run_to_idle();
    }

    fn run_to_idle(&mut self) {
        while self.gc.phase != GcPhase::Idle {
            match self.gc.phase {
                GcPhase::Idle => unreachable!(),
                GcPhase::Mark => {
                    if let Some(r) = self.gc.gray.pop() {
                        self.mark_object(r);
                    } else {
                        self.atomic_remark();
                        self.gc.white = !self.gc.white;
                        self.gc.phase = GcPhase::Sweep {
                            arena: 0,
                            cursor: 0,
                        };
                    }
                }
                GcPhase::Sweep { arena, cursor } => {
                    let mut unlimited = usize::MAX;
                    let (next, freed) = self.sweep_increment(arena, cursor, &mut unlimited);
                    match next {
                        Some((arena, cursor)) => {
                            self.gc.phase = GcPhase::Sweep { arena, cursor };
                        }
                        None => self.finish_cycle(freed),
                    }
                }
            }
        }
    }

    fn begin_mark(&mut self) {
        debug_assert!(self.gc.gray.is_empty());
        self.gc.phase = GcPhase::Mark;
        let mut roots: Vec<GcRef> = self.roots.clone();
        roots.extend(self.recent.iter().copied());
        for r in roots {
            self.mark_gray(r);
        }
    }

    fn mark_gray(&mut self, r: GcRef) {
        let header = self.header_of_mut(r);
        if matches!(header.color, GcColor::White(_)) {
            header.color = GcColor::Gray;
            self.gc.gray.push(r);
        }
    }

    /// Blackens one object and grays its white children. Returns the
    /// object's size as the work performed.
    fn mark_object(&mut self, r: GcRef) -> usize {
        {
            let header = self.header_of_mut(r);
            if header.color == GcColor::Black {
                return 0;
            }
            header.color = GcColor::Black;
        }
        let mut children = Vec::new();
        self.children_of(r, &mut children);
        for child in children {
            self.mark_gray(child);
        }
        self.header_of(r).size
    }

    /// The atomic step: thread stacks are written without barriers, so every
    /// live thread is re-traversed, then the gray set drained to fixpoint.
    fn atomic_remark(&mut self) {
        let threads: Vec<ThreadRef> = self.threads.indices().map(ThreadRef).collect();
        for t in threads {
            let r = GcRef::Thread(t);
            if self.header_of(r).color == GcColor::Black {
                self.header_of_mut(r).color = GcColor::Gray;
                self.gc.gray.push(r);
            }
        }
        let mut roots: Vec<GcRef> = self.roots.clone();
        roots.extend(self.recent.iter().copied());
        for r in roots {
            self.mark_gray(r);
        }
        while let Some(r) = self.gc.gray.pop() {
            self.mark_object(r);
        }
    }

    /// Sweeps slots until the budget is spent. Returns the next cursor (or
    /// None when all arenas are swept) and the bytes freed so far.
    fn sweep_increment(
        &mut self,
        mut arena: u8,
        mut cursor: usize,
        budget: &mut usize,
    ) -> (Option<(u8, usize)>, usize) {
        let dead_white = !self.gc.white;
        let mut freed = 0usize;
        while *budget > 0 {
            let slot_count = self.arena_slot_count(arena);
            if cursor >= slot_count {
                cursor = 0;
                arena += 1;
                if arena >= ARENA_COUNT {
                    return (None, freed);
                }
                continue;
            }
            let index = cursor as u32;
            cursor += 1;
            *budget = budget.saturating_sub(64);
            freed += self.sweep_slot(arena, index, dead_white);
        }
        (Some((arena, cursor)), freed)
    }

    fn arena_slot_count(&self, arena: u8) -> usize {
        match arena {
            0 => self.strings.slot_count(),
            1 => self.tables.slot_count(),
            2 => self.closures.slot_count(),
            3 => self.threads.slot_count(),
            4 => self.userdata.slot_count(),
            5 => self.buffers.slot_count(),
            6 => self.upvalues.slot_count(),
            7 => self.protos.slot_count(),
            _ => 0,
        }
    }

    /// Frees the slot if it is condemned, otherwise recolours it to the new
    /// white. Returns bytes freed.
    fn sweep_slot(&mut self, arena: u8, index: u32, dead_white: bool) -> usize {
        macro_rules! sweep_arena {
            ($field:ident, |$entry:ident| $finalize:block) => {{
                let condemned = match self.$field.get(index) {
                    Some(entry) => {
                        !entry.header.fixed && entry.header.color == GcColor::White(dead_white)
                    }
                    None => return 0,
                };
                if condemned {
                    #[allow(unused_mut)]
                    let mut $entry = self.$field.take(index).expect("slot vanished during sweep");
                    let bytes = $entry.header.size;
                    let memcat = $entry.header.memcat;
                    $finalize
                    self.uncharge(memcat, bytes);
                    bytes
                } else {
                    let entry = self
                        .$field
                        .get_mut(index)
                        .expect("slot vanished during sweep");
                    entry.header.color = GcColor::White(!dead_white);
                    0
                }
            }};
        }

        match arena {
            0 => sweep_arena!(strings, |entry| {
                let hash = entry.body.hash;
                self.remove_interned(hash, StringRef(index));
            }),
            1 => sweep_arena!(tables, |entry| {}),
            2 => sweep_arena!(closures, |entry| {}),
            3 => sweep_arena!(threads, |entry| {}),
            4 => sweep_arena!(userdata, |entry| {
                let tag = entry.body.tag;
                if let Some(dtor) = self.userdata_dtor(tag) {
                    dtor(&mut entry.body);
                }
            }),
            5 => sweep_arena!(buffers, |entry| {}),
            6 => sweep_arena!(upvalues, |entry| {}),
            7 => sweep_arena!(protos, |entry| {}),
            _ => 0,
        }
    }

    fn finish_cycle(&mut self, freed: usize) {
        self.gc.phase = GcPhase::Idle;
        self.gc.cycle_count += 1;
        let goal = self.gc.goal_percent as usize;
        self.gc.threshold = ((self.total_bytes() / 100) * goal).max(64 * 1024);
        log::debug!(
            "gc cycle {} complete: {} bytes freed, {} live, next at {}",
            self.gc.cycle_count,
            freed,
            self.total_bytes(),
            self.gc.threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use crate::value::Value;

    #[test]
    fn test_unreachable_table_is_collected() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);

        let kept = heap.new_table(Table::new()).unwrap();
        heap.add_root(GcRef::Table(kept));
        let dropped = heap.new_table(Table::new()).unwrap();

        let before = heap.total_bytes();
        heap.collect_full();
        assert!(heap.total_bytes() < before);
        // The kept table survives and is usable.
        heap.table_mut(kept).set(Value::Number(1.0), Value::Number(2.0)).unwrap();
        assert!(heap.tables.get(dropped.index()).is_none());
    }

    #[test]
    fn test_reachable_graph_survives() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);

        let outer = heap.new_table(Table::new()).unwrap();
        let inner = heap.new_table(Table::new()).unwrap();
        heap.table_set(outer, Value::Number(1.0), Value::Table(inner))
            .unwrap();
        heap.add_root(GcRef::Table(outer));

        heap.collect_full();
        assert_eq!(
            heap.table(outer).get(Value::Number(1.0)),
            Value::Table(inner)
        );
        assert!(heap.tables.get(inner.index()).is_some());
    }

    #[test]
    fn test_fixed_object_survives_unreachable() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);

        let fixed = heap.new_table(Table::new()).unwrap();
        heap.fix_reachable(GcRef::Table(fixed));
        assert!(heap.is_fixed(GcRef::Table(fixed)));

        heap.collect_full();
        heap.collect_full();
        assert!(heap.tables.get(fixed.index()).is_some());
    }

    #[test]
    fn test_fix_reachable_is_transitive() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);

        let outer = heap.new_table(Table::new()).unwrap();
        let inner = heap.new_table(Table::new()).unwrap();
        heap.table_set(outer, Value::Number(1.0), Value::Table(inner))
            .unwrap();
        heap.fix_reachable(GcRef::Table(outer));
        assert!(heap.is_fixed(GcRef::Table(inner)));
    }

    #[test]
    fn test_interned_string_dedupes_and_survives() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);

        let a = heap.intern(b"hello").unwrap();
        let b = heap.intern(b"hello").unwrap();
        assert_eq!(a, b);

        let holder = heap.new_table(Table::new()).unwrap();
        heap.table_set(holder, Value::Number(1.0), Value::String(a))
            .unwrap();
        heap.add_root(GcRef::Table(holder));
        heap.collect_full();
        assert_eq!(heap.string_bytes(a), b"hello");
        // Interning after a cycle still finds the same handle.
        assert_eq!(heap.intern(b"hello").unwrap(), a);
    }

    #[test]
    fn test_category_accounting_and_limit() {
        let config = VmConfig::default().with_category_limit(7, 200);
        let mut heap = Heap::new(&config);
        heap.set_active_memcat(7);

        assert_eq!(heap.memory_used(7), 0);
        let first = heap.new_buffer(crate::buffer::Buffer::new(64)).unwrap();
        assert!(heap.memory_used(7) >= 64);

        // Rooted allocation that pushes the category over its limit fails
        // even after the emergency collection.
        heap.add_root(GcRef::Buffer(first));
        let result = heap.new_buffer(crate::buffer::Buffer::new(512));
        assert!(matches!(
            result,
            Err(crate::error::VmError::CategoryLimitExceeded { category: 7, .. })
        ));
    }

    #[test]
    fn test_before_allocate_veto() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);
        heap.set_before_allocate(Some(Box::new(|_, _, new_used| new_used < 100)));

        assert!(heap.new_buffer(crate::buffer::Buffer::new(16)).is_ok());
        assert!(matches!(
            heap.new_buffer(crate::buffer::Buffer::new(4096)),
            Err(crate::error::VmError::OutOfMemory)
        ));
    }

    #[test]
    fn test_pause_guard_blocks_collection() {
        let config = VmConfig::default();
        let mut heap = Heap::new(&config);
        let unrooted = heap.new_table(Table::new()).unwrap();

        heap.gc_pause();
        heap.collect_full();
        assert!(heap.tables.get(unrooted.index()).is_some());
        heap.gc_unpause();
        heap.collect_full();
        assert!(heap.tables.get(unrooted.index()).is_none());
    }
}
