//! The garbage-collected heap.
//!
//! Objects live in per-kind arenas and are addressed by typed handles, so
//! values stay `Copy` and the collector can traverse without raw pointers.
//! Every object carries a header with its mark colour, memory category, and
//! the fixed bit that exempts it from reclamation. Allocation charges the
//! active category and consults the embedder's hooks; the collector itself
//! lives in [`crate::gc`].

use hashbrown::HashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::buffer::Buffer;
use crate::closure::Closure;
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::gc::{GcPhase, GcState};
use crate::table::Table;
use crate::thread::{Thread, Upvalue};
use crate::userdata::{Userdata, UserdataPayload};
use crate::value::{
    BufferRef, ClosureRef, ProtoRef, StringRef, TableRef, ThreadRef, UpvalueRef, UserdataRef,
    Value,
};
use crate::bytecode::proto::Proto;

/// Mark colour of a collectable object. White carries a parity bit so that
/// objects allocated during the sweep are not condemned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcColor {
    White(bool),
    Gray,
    Black,
}

/// Header shared by all collectable objects.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectHeader {
    pub color: GcColor,
    pub memcat: u8,
    pub fixed: bool,
    pub size: usize,
}

pub(crate) struct Entry<T> {
    pub header: ObjectHeader,
    pub body: T,
}

/// Slot arena with index reuse.
pub(crate) struct Arena<T> {
    slots: Vec<Option<Entry<T>>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, entry: Entry<T>) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub(crate) fn get(&self, index: u32) -> Option<&Entry<T>> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut Entry<T>> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    pub(crate) fn take(&mut self, index: u32) -> Option<Entry<T>> {
        let taken = self.slots.get_mut(index as usize).and_then(|s| s.take());
        if taken.is_some() {
            self.free.push(index);
        }
        taken
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Live indices, for sweeping and diagnostics.
    pub(crate) fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u32)
    }
}

/// An interned immutable string.
pub(crate) struct HeapString {
    pub bytes: Box<[u8]>,
    pub hash: u64,
}

/// Kind-erased handle used by traversal, roots, and the permanents table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcRef {
    String(StringRef),
    Table(TableRef),
    Closure(ClosureRef),
    Thread(ThreadRef),
    Userdata(UserdataRef),
    Buffer(BufferRef),
    Upvalue(UpvalueRef),
    Proto(ProtoRef),
}

impl GcRef {
    /// The collectable handle of a value, if it has one.
    pub fn from_value(value: Value) -> Option<GcRef> {
        match value {
            Value::String(r) => Some(GcRef::String(r)),
            Value::Table(r) => Some(GcRef::Table(r)),
            Value::Closure(r) => Some(GcRef::Closure(r)),
            Value::Thread(r) => Some(GcRef::Thread(r)),
            Value::Userdata(r) => Some(GcRef::Userdata(r)),
            Value::Buffer(r) => Some(GcRef::Buffer(r)),
            _ => None,
        }
    }
}

/// Hook signatures for allocation accounting.
pub type BeforeAllocateHook = Box<dyn FnMut(Option<ThreadRef>, usize, usize) -> bool>;
pub type OnAllocateHook = Box<dyn FnMut(Option<ThreadRef>, usize, usize)>;

/// The heap: typed arenas, the intern table, category accounting, and the
/// collector state.
pub struct Heap {
    pub(crate) strings: Arena<HeapString>,
    pub(crate) tables: Arena<Table>,
    pub(crate) closures: Arena<Closure>,
    pub(crate) threads: Arena<Thread>,
    pub(crate) userdata: Arena<Userdata>,
    pub(crate) buffers: Arena<Buffer>,
    pub(crate) upvalues: Arena<Upvalue>,
    pub(crate) protos: Arena<Proto>,

    /// hash -> interned strings with that hash.
    intern_table: HashMap<u64, Vec<StringRef>>,

    pub(crate) gc: GcState,
    pub(crate) roots: Vec<GcRef>,
    /// Objects allocated since the last safepoint. An emergency collection
    /// can fire inside an allocation, while the mutator still holds some
    /// of these only in native locals; they are treated as roots until the
    /// next safepoint proves everything reachable is on a rooted stack.
    pub(crate) recent: Vec<GcRef>,

    category_bytes: Vec<usize>,
    category_limits: HashMap<u8, usize>,
    total_bytes: usize,
    active_memcat: u8,
    active_thread: Option<ThreadRef>,
    in_emergency_collect: bool,

    before_allocate: Option<BeforeAllocateHook>,
    on_allocate: Option<OnAllocateHook>,
    userdata_dtors: HashMap<u8, fn(&mut Userdata)>,
}

impl Heap {
    /// Creates a heap with the given collector configuration.
    pub fn new(config: &VmConfig) -> Self {
        Heap {
            strings: Arena::new(),
            tables: Arena::new(),
            closures: Arena::new(),
            threads: Arena::new(),
            userdata: Arena::new(),
            buffers: Arena::new(),
            upvalues: Arena::new(),
            protos: Arena::new(),
            intern_table: HashMap::new(),
            gc: GcState::new(config),
            roots: Vec::new(),
            recent: Vec::new(),
            category_bytes: vec![0; 256],
            category_limits: config.category_limits.clone(),
            total_bytes: 0,
            active_memcat: 0,
            active_thread: None,
            in_emergency_collect: false,
            before_allocate: None,
            on_allocate: None,
            userdata_dtors: HashMap::new(),
        }
    }

    // ---- accounting ----------------------------------------------------

    /// Total bytes attributed to one memory category.
    pub fn memory_used(&self, category: u8) -> usize {
        self.category_bytes[category as usize]
    }

    /// Total bytes across all categories.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Sets the category charged for subsequent allocations.
    pub fn set_active_memcat(&mut self, category: u8) {
        self.active_memcat = category;
    }

    /// Returns the category charged for subsequent allocations.
    pub fn active_memcat(&self) -> u8 {
        self.active_memcat
    }

    pub(crate) fn set_active_thread(&mut self, thread: Option<ThreadRef>) {
        self.active_thread = thread;
    }

    /// Installs the veto hook consulted before every allocation.
    pub fn set_before_allocate(&mut self, hook: Option<BeforeAllocateHook>) {
        self.before_allocate = hook;
    }

    /// Installs the notification hook run after every allocation.
    pub fn set_on_allocate(&mut self, hook: Option<OnAllocateHook>) {
        self.on_allocate = hook;
    }

    /// Registers a destructor for a userdata tag, run when an object with
    /// that tag is reclaimed.
    pub fn register_userdata_dtor(&mut self, tag: u8, dtor: fn(&mut Userdata)) {
        self.userdata_dtors.insert(tag, dtor);
    }

    pub(crate) fn userdata_dtor(&self, tag: u8) -> Option<fn(&mut Userdata)> {
        self.userdata_dtors.get(&tag).copied()
    }

    /// Charges `bytes` to the active category, running the veto hook and,
    /// on a limit breach, one emergency full collection before failing.
    fn charge(&mut self, bytes: usize) -> VmResult<()> {
        let category = self.active_memcat;
        let old_used = self.category_bytes[category as usize];
        let new_used = old_used + bytes;

        if let Some(hook) = self.before_allocate.as_mut() {
            if !hook(self.active_thread, old_used, new_used) {
                return Err(VmError::OutOfMemory);
            }
        }

        if let Some(&limit) = self.category_limits.get(&category) {
            if new_used > limit && !self.in_emergency_collect && self.gc.pause_depth == 0 {
                log::warn!(
                    "category {category} at {new_used} over {limit}; emergency collection"
                );
                self.in_emergency_collect = true;
                self.collect_full_keeping_recent();
                self.in_emergency_collect = false;
            }
            let retry_used = self.category_bytes[category as usize] + bytes;
            if retry_used > limit {
                return Err(VmError::CategoryLimitExceeded {
                    category,
                    used: retry_used,
                    limit,
                });
            }
        }

        let old_used = self.category_bytes[category as usize];
        let new_used = old_used + bytes;
        self.category_bytes[category as usize] = new_used;
        self.total_bytes += bytes;
        self.gc.debt += bytes;

        if let Some(hook) = self.on_allocate.as_mut() {
            hook(self.active_thread, old_used, new_used);
        }
        Ok(())
    }

    pub(crate) fn uncharge(&mut self, category: u8, bytes: usize) {
        let slot = &mut self.category_bytes[category as usize];
        *slot = slot.saturating_sub(bytes);
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
    }

    fn header(memcat: u8, color: GcColor, size: usize) -> ObjectHeader {
        ObjectHeader {
            color,
            memcat,
            fixed: false,
            size,
        }
    }

    fn new_color(&self) -> GcColor {
        GcColor::White(self.gc.white)
    }

    // ---- strings -------------------------------------------------------

    /// Interns a byte string. Equal contents always yield the same handle,
    /// so string equality is handle equality.
    pub fn intern(&mut self, bytes: &[u8]) -> VmResult<StringRef> {
        let hash = xxh3_64(bytes);
        if let Some(bucket) = self.intern_table.get(&hash) {
            for &candidate in bucket {
                let entry = self
                    .strings
                    .get(candidate.0)
                    .expect("intern table references dead string");
                if entry.body.bytes.as_ref() == bytes {
                    // Resurrect a condemned string rather than duplicating it.
                    let current = self.new_color();
                    let entry = self
                        .strings
                        .get_mut(candidate.0)
                        .expect("intern table references dead string");
                    if let GcColor::White(parity) = entry.header.color {
                        if parity != self.gc.white {
                            entry.header.color = current;
                        }
                    }
                    return Ok(candidate);
                }
            }
        }

        let size = std::mem::size_of::<HeapString>() + bytes.len();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.strings.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: HeapString {
                bytes: bytes.to_vec().into_boxed_slice(),
                hash,
            },
        });
        let r = StringRef(index);
        self.intern_table.entry(hash).or_default().push(r);
        self.recent.push(GcRef::String(r));
        Ok(r)
    }

    /// The bytes of an interned string.
    pub fn string_bytes(&self, r: StringRef) -> &[u8] {
        &self
            .strings
            .get(r.0)
            .expect("dangling string handle")
            .body
            .bytes
    }

    /// The string as UTF-8, replacing invalid sequences.
    pub fn string_lossy(&self, r: StringRef) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.string_bytes(r))
    }

    pub(crate) fn remove_interned(&mut self, hash: u64, r: StringRef) {
        if let Some(bucket) = self.intern_table.get_mut(&hash) {
            bucket.retain(|&s| s != r);
            if bucket.is_empty() {
                self.intern_table.remove(&hash);
            }
        }
    }

    // ---- allocation ----------------------------------------------------

    /// Allocates a table.
    pub fn new_table(&mut self, table: Table) -> VmResult<TableRef> {
        let size = table.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.tables.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: table,
        });
        let r = TableRef(index);
        self.recent.push(GcRef::Table(r));
        Ok(r)
    }

    /// Allocates a closure.
    pub fn new_closure(&mut self, closure: Closure) -> VmResult<ClosureRef> {
        let size = closure.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.closures.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: closure,
        });
        let r = ClosureRef(index);
        self.recent.push(GcRef::Closure(r));
        Ok(r)
    }

    /// Allocates a thread.
    pub fn new_thread(&mut self, thread: Thread) -> VmResult<ThreadRef> {
        let size = thread.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.threads.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: thread,
        });
        let r = ThreadRef(index);
        self.recent.push(GcRef::Thread(r));
        Ok(r)
    }

    /// Allocates a userdata.
    pub fn new_userdata(&mut self, userdata: Userdata) -> VmResult<UserdataRef> {
        let size = userdata.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.userdata.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: userdata,
        });
        let r = UserdataRef(index);
        self.recent.push(GcRef::Userdata(r));
        Ok(r)
    }

    /// Allocates a buffer.
    pub fn new_buffer(&mut self, buffer: Buffer) -> VmResult<BufferRef> {
        let size = buffer.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.buffers.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: buffer,
        });
        let r = BufferRef(index);
        self.recent.push(GcRef::Buffer(r));
        Ok(r)
    }

    /// Allocates an upvalue cell.
    pub fn new_upvalue(&mut self, upvalue: Upvalue) -> VmResult<UpvalueRef> {
        let size = std::mem::size_of::<Upvalue>();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.upvalues.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: upvalue,
        });
        let r = UpvalueRef(index);
        self.recent.push(GcRef::Upvalue(r));
        Ok(r)
    }

    /// Allocates a prototype.
    pub fn new_proto(&mut self, proto: Proto) -> VmResult<ProtoRef> {
        let size = proto.byte_size();
        self.charge(size)?;
        let color = self.new_color();
        let index = self.protos.insert(Entry {
            header: Heap::header(self.active_memcat, color, size),
            body: proto,
        });
        let r = ProtoRef(index);
        self.recent.push(GcRef::Proto(r));
        Ok(r)
    }

    // ---- typed accessors ----------------------------------------------
    // A dangling handle is a VM invariant violation; these panic rather
    // than propagate, matching the fatal internal-error policy.

    pub fn table(&self, r: TableRef) -> &Table {
        &self.tables.get(r.0).expect("dangling table handle").body
    }

    pub fn table_mut(&mut self, r: TableRef) -> &mut Table {
        &mut self
            .tables
            .get_mut(r.0)
            .expect("dangling table handle")
            .body
    }

    pub fn closure(&self, r: ClosureRef) -> &Closure {
        &self.closures.get(r.0).expect("dangling closure handle").body
    }

    pub fn closure_mut(&mut self, r: ClosureRef) -> &mut Closure {
        &mut self
            .closures
            .get_mut(r.0)
            .expect("dangling closure handle")
            .body
    }

    pub fn thread(&self, r: ThreadRef) -> &Thread {
        &self.threads.get(r.0).expect("dangling thread handle").body
    }

    pub fn thread_mut(&mut self, r: ThreadRef) -> &mut Thread {
        &mut self
            .threads
            .get_mut(r.0)
            .expect("dangling thread handle")
            .body
    }

    pub fn userdata(&self, r: UserdataRef) -> &Userdata {
        &self.userdata.get(r.0).expect("dangling userdata handle").body
    }

    pub fn userdata_mut(&mut self, r: UserdataRef) -> &mut Userdata {
        &mut self
            .userdata
            .get_mut(r.0)
            .expect("dangling userdata handle")
            .body
    }

    pub fn buffer(&self, r: BufferRef) -> &Buffer {
        &self.buffers.get(r.0).expect("dangling buffer handle").body
    }

    pub fn buffer_mut(&mut self, r: BufferRef) -> &mut Buffer {
        &mut self
            .buffers
            .get_mut(r.0)
            .expect("dangling buffer handle")
            .body
    }

    pub fn upvalue(&self, r: UpvalueRef) -> &Upvalue {
        &self.upvalues.get(r.0).expect("dangling upvalue handle").body
    }

    pub fn upvalue_mut(&mut self, r: UpvalueRef) -> &mut Upvalue {
        &mut self
            .upvalues
            .get_mut(r.0)
            .expect("dangling upvalue handle")
            .body
    }

    pub fn proto(&self, r: ProtoRef) -> &Proto {
        &self.protos.get(r.0).expect("dangling proto handle").body
    }

    // ---- mutation helpers with accounting and barriers ------------------

    /// Table write with accounting and the collector's forward barrier.
    pub fn table_set(&mut self, table: TableRef, key: Value, value: Value) -> VmResult<()> {
        let entry = self.tables.get_mut(table.0).expect("dangling table handle");
        let old_size = entry.header.size;
        entry.body.set(key, value)?;
        let new_size = entry.body.byte_size();
        let memcat = entry.header.memcat;
        entry.header.size = new_size;
        if new_size > old_size {
            self.charge_resize(memcat, new_size - old_size)?;
        } else {
            self.uncharge(memcat, old_size - new_size);
        }
        self.write_barrier(GcRef::Table(table), key);
        self.write_barrier(GcRef::Table(table), value);
        Ok(())
    }

    /// Adjusts the recorded size of an object after in-place growth.
    pub(crate) fn recharge(&mut self, r: GcRef, new_size: usize) -> VmResult<()> {
        let (memcat, old_size) = {
            let header = self.header_of(r);
            (header.memcat, header.size)
        };
        self.header_of_mut(r).size = new_size;
        if new_size > old_size {
            self.charge_resize(memcat, new_size - old_size)?;
        } else {
            self.uncharge(memcat, old_size - new_size);
        }
        Ok(())
    }

    /// Charges growth to an explicit category, bypassing the veto hook's
    /// active-category assumption but still honouring limits.
    fn charge_resize(&mut self, category: u8, bytes: usize) -> VmResult<()> {
        let previous = self.active_memcat;
        self.active_memcat = category;
        let result = self.charge(bytes);
        self.active_memcat = previous;
        result
    }

    /// Recomputes a thread's accounted size after stack or frame growth.
    pub(crate) fn recharge_thread(&mut self, r: ThreadRef) -> VmResult<()> {
        let size = self.thread(r).byte_size();
        self.recharge(GcRef::Thread(r), size)
    }

    pub(crate) fn header_of(&self, r: GcRef) -> &ObjectHeader {
        match r {
            GcRef::String(x) => &self.strings.get(x.0).expect("dangling string handle").header,
            GcRef::Table(x) => &self.tables.get(x.0).expect("dangling table handle").header,
            GcRef::Closure(x) => {
                &self.closures.get(x.0).expect("dangling closure handle").header
            }
            GcRef::Thread(x) => &self.threads.get(x.0).expect("dangling thread handle").header,
            GcRef::Userdata(x) => {
                &self.userdata.get(x.0).expect("dangling userdata handle").header
            }
            GcRef::Buffer(x) => &self.buffers.get(x.0).expect("dangling buffer handle").header,
            GcRef::Upvalue(x) => {
                &self.upvalues.get(x.0).expect("dangling upvalue handle").header
            }
            GcRef::Proto(x) => &self.protos.get(x.0).expect("dangling proto handle").header,
        }
    }

    pub(crate) fn header_of_mut(&mut self, r: GcRef) -> &mut ObjectHeader {
        match r {
            GcRef::String(x) => {
                &mut self.strings.get_mut(x.0).expect("dangling string handle").header
            }
            GcRef::Table(x) => {
                &mut self.tables.get_mut(x.0).expect("dangling table handle").header
            }
            GcRef::Closure(x) => {
                &mut self
                    .closures
                    .get_mut(x.0)
                    .expect("dangling closure handle")
                    .header
            }
            GcRef::Thread(x) => {
                &mut self.threads.get_mut(x.0).expect("dangling thread handle").header
            }
            GcRef::Userdata(x) => {
                &mut self
                    .userdata
                    .get_mut(x.0)
                    .expect("dangling userdata handle")
                    .header
            }
            GcRef::Buffer(x) => {
                &mut self.buffers.get_mut(x.0).expect("dangling buffer handle").header
            }
            GcRef::Upvalue(x) => {
                &mut self
                    .upvalues
                    .get_mut(x.0)
                    .expect("dangling upvalue handle")
                    .header
            }
            GcRef::Proto(x) => {
                &mut self.protos.get_mut(x.0).expect("dangling proto handle").header
            }
        }
    }

    /// Whether an object has the fixed bit set.
    pub fn is_fixed(&self, r: GcRef) -> bool {
        self.header_of(r).fixed
    }

    // ---- roots ----------------------------------------------------------

    /// Pins an object as a collection root.
    pub fn add_root(&mut self, r: GcRef) {
        if !self.roots.contains(&r) {
            self.roots.push(r);
        }
    }

    /// Unpins a root.
    pub fn remove_root(&mut self, r: GcRef) {
        self.roots.retain(|&existing| existing != r);
    }

    /// Marks a safepoint: everything live is now reachable from a rooted
    /// stack, so the recent-allocation pins can be dropped.
    pub(crate) fn note_safepoint(&mut self) {
        self.recent.clear();
    }

    // ---- traversal -------------------------------------------------------

    /// Collects the objects directly referenced by `r`.
    pub(crate) fn children_of(&self, r: GcRef, out: &mut Vec<GcRef>) {
        let mut push_value = |out: &mut Vec<GcRef>, v: Value| {
            if let Some(child) = GcRef::from_value(v) {
                out.push(child);
            }
        };
        match r {
            GcRef::String(_) | GcRef::Buffer(_) => {}
            GcRef::Table(x) => {
                for v in self.table(x).referenced_values() {
                    push_value(out, v);
                }
            }
            GcRef::Closure(x) => match self.closure(x) {
                Closure::Script(sc) => {
                    out.push(GcRef::Proto(sc.proto));
                    out.extend(sc.upvalues.iter().map(|&u| GcRef::Upvalue(u)));
                }
                Closure::Native(nc) => {
                    for &v in &nc.upvalues {
                        push_value(out, v);
                    }
                }
            },
            GcRef::Thread(x) => {
                let thread = self.thread(x);
                for &v in &thread.stack {
                    push_value(out, v);
                }
                for frame in &thread.frames {
                    out.push(GcRef::Closure(frame.closure));
                }
                out.push(GcRef::Table(thread.globals));
                if let Some(parent) = thread.parent {
                    out.push(GcRef::Thread(parent));
                }
                out.extend(thread.open_upvalues.iter().map(|&u| GcRef::Upvalue(u)));
            }
            GcRef::Userdata(x) => {
                let ud = self.userdata(x);
                if let Some(mt) = ud.metatable {
                    out.push(GcRef::Table(mt));
                }
                match &ud.payload {
                    UserdataPayload::Raw(_) => {}
                    UserdataPayload::EventManager(m) => {
                        for v in m.referenced_values() {
                            push_value(out, v);
                        }
                    }
                    UserdataPayload::TimerManager(m) => {
                        for v in m.referenced_values() {
                            push_value(out, v);
                        }
                    }
                }
            }
            GcRef::Upvalue(x) => match self.upvalue(x) {
                Upvalue::Open { thread, .. } => out.push(GcRef::Thread(*thread)),
                Upvalue::Closed(v) => push_value(out, *v),
            },
            GcRef::Proto(x) => {
                let proto = self.proto(x);
                for &v in &proto.constants {
                    push_value(out, v);
                }
                out.extend(proto.children.iter().map(|&c| GcRef::Proto(c)));
                if let Some(source) = proto.source {
                    out.push(GcRef::String(source));
                }
            }
        }
    }

    /// Sets the fixed bit on every object reachable from `root`. Used to
    /// pin a loaded base image so it outlives any script instance.
    pub fn fix_reachable(&mut self, root: GcRef) {
        let mut visited: hashbrown::HashSet<GcRef> = hashbrown::HashSet::new();
        let mut work = vec![root];
        let mut children = Vec::new();
        while let Some(r) = work.pop() {
            if !visited.insert(r) {
                continue;
            }
            self.header_of_mut(r).fixed = true;
            children.clear();
            self.children_of(r, &mut children);
            work.extend(children.iter().copied());
        }
    }

    // ---- write barrier ---------------------------------------------------

    /// Forward barrier: keeps the tri-colour invariant when a white child
    /// is stored into a black parent during marking.
    pub(crate) fn write_barrier(&mut self, parent: GcRef, child: Value) {
        if self.gc.phase != GcPhase::Mark {
            return;
        }
        let Some(child) = GcRef::from_value(child) else {
            return;
        };
        if self.header_of(parent).color != GcColor::Black {
            return;
        }
        if matches!(self.header_of(child).color, GcColor::White(_)) {
            self.header_of_mut(child).color = GcColor::Gray;
            self.gc.gray.push(child);
        }
    }

    // ---- upvalue management ---------------------------------------------

    /// Finds the open upvalue for a stack slot, creating and linking one if
    /// none exists. Closures capturing the same slot share the cell.
    pub fn find_or_create_upvalue(
        &mut self,
        thread: ThreadRef,
        slot: usize,
    ) -> VmResult<UpvalueRef> {
        let existing = {
            let t = self.thread(thread);
            t.open_upvalues
                .iter()
                .copied()
                .find(|&u| matches!(self.upvalue(u), Upvalue::Open { slot: s, .. } if *s == slot))
        };
        if let Some(u) = existing {
            return Ok(u);
        }
        let u = self.new_upvalue(Upvalue::Open { thread, slot })?;
        // Keep the list ordered by slot so closing a range is a suffix scan.
        let insert_at = {
            let t = self.thread(thread);
            t.open_upvalues
                .iter()
                .position(|&other| match self.upvalue(other) {
                    Upvalue::Open { slot: s, .. } => *s > slot,
                    Upvalue::Closed(_) => false,
                })
                .unwrap_or(t.open_upvalues.len())
        };
        self.thread_mut(thread).open_upvalues.insert(insert_at, u);
        Ok(u)
    }

    /// Closes every open upvalue at `from_slot` or above: the cell copies
    /// the stack value and unlinks from the thread.
    pub fn close_upvalues(&mut self, thread: ThreadRef, from_slot: usize) {
        let to_close: Vec<(UpvalueRef, usize)> = {
            let t = self.thread(thread);
            t.open_upvalues
                .iter()
                .copied()
                .filter_map(|u| match self.upvalue(u) {
                    Upvalue::Open { slot, .. } if *slot >= from_slot => Some((u, *slot)),
                    _ => None,
                })
                .collect()
        };
        for (u, slot) in &to_close {
            let value = self.thread(thread).stack.get(*slot).copied().unwrap_or(Value::Nil);
            *self.upvalue_mut(*u) = Upvalue::Closed(value);
            self.write_barrier(GcRef::Upvalue(*u), value);
        }
        let t = self.thread_mut(thread);
        t.open_upvalues
            .retain(|u| !to_close.iter().any(|(closed, _)| closed == u));
    }

    /// Reads through an upvalue cell.
    pub fn upvalue_get(&self, u: UpvalueRef) -> Value {
        match self.upvalue(u) {
            Upvalue::Closed(v) => *v,
            Upvalue::Open { thread, slot } => self
                .thread(*thread)
                .stack
                .get(*slot)
                .copied()
                .unwrap_or(Value::Nil),
        }
    }

    /// Writes through an upvalue cell.
    pub fn upvalue_set(&mut self, u: UpvalueRef, value: Value) {
        match self.upvalue(u).clone() {
            Upvalue::Closed(_) => {
                *self.upvalue_mut(u) = Upvalue::Closed(value);
                self.write_barrier(GcRef::Upvalue(u), value);
            }
            Upvalue::Open { thread, slot } => {
                let t = self.thread_mut(thread);
                if slot < t.stack.len() {
                    t.stack[slot] = value;
                }
            }
        }
    }
}
