//! Moving copying collector
//!
//! The heap is a vector of slots holding objects of a single type `T`.
//! References are indices (`GcRef`), so a collection is free to relocate
//! every live object: evacuated slots leave a forwarding entry behind
//! ("broken heart") and every reference reachable from the roots is
//! rewritten to the new index.
//!
//! The heap does not know where the roots live. The owner passes a tracing
//! callback to [`Heap::collect`] that visits every root reference it holds
//! (stacks, the current environment, cached types). Objects can also be
//! pinned directly with [`Heap::register_global_root`]; those are scanned
//! before the owner's roots on every collection.
//!
//! Allocation never collects. The owner checks [`Heap::should_collect`] at
//! its safe points (the VM does so at instruction boundaries) and calls
//! `collect` with its roots in hand.

use std::mem;

use tracing::debug;

/// A reference to a heap object. Indices are only stable between
/// collections; holders reachable from the roots are rewritten in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl GcRef {
    /// Raw slot index, for diagnostics only.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Object behaviour the collector needs, one impl per heap object type.
///
/// This plays the role of a per-variant shape table: how to find the
/// references inside an object, how much memory it retains outside its
/// slot, and whether it wants a finalize call when it dies.
pub trait Shape {
    /// Visit every `GcRef` held by this object so the collector can
    /// rewrite it. Allocation is not possible during this call.
    fn update_refs(&mut self, f: &mut dyn FnMut(&mut GcRef));

    /// Bytes retained outside the slot itself, counted against the
    /// allocation budget.
    fn retained_size(&self) -> usize {
        0
    }

    /// Whether [`Shape::finalize`] must run when the object is collected.
    fn needs_finalize(&self) -> bool {
        false
    }

    /// Release external resources. Runs on unreachable objects after the
    /// live set has been evacuated, before the old space is dropped.
    fn finalize(&mut self) {}
}

/// Handle returned by [`Heap::register_global_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHandle(usize);

/// Collection statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Completed collections since the heap was created.
    pub collections: u64,
    /// Live objects after the last collection.
    pub live: usize,
    /// Objects reclaimed by the last collection.
    pub reclaimed: usize,
}

enum Slot<T> {
    Obj(T),
    /// Broken heart: the object moved to this index in to-space.
    Forward(u32),
    /// Transient marker while an evacuated object has its fields updated.
    Moved,
}

/// Default allocation budget between collections, in retained bytes.
const DEFAULT_BUDGET: usize = 4 * 1024 * 1024;

pub struct Heap<T: Shape> {
    slots: Vec<Slot<T>>,
    /// Pinned roots, scanned before the owner's roots. Slab with free list.
    roots: Vec<Option<GcRef>>,
    free_roots: Vec<usize>,
    budget: usize,
    since_gc: usize,
    stats: GcStats,
}

impl<T: Shape> Heap<T> {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_BUDGET)
    }

    /// A heap that requests collection once `budget` bytes have been
    /// retained since the last one.
    pub fn with_budget(budget: usize) -> Self {
        Heap {
            slots: Vec::new(),
            roots: Vec::new(),
            free_roots: Vec::new(),
            budget,
            since_gc: 0,
            stats: GcStats::default(),
        }
    }

    /// Allocate `obj` and return a reference to it.
    ///
    /// Out-of-memory is fatal by design: `Vec` growth aborts the process,
    /// there is no recovery path for the caller.
    pub fn alloc(&mut self, obj: T) -> GcRef {
        self.since_gc += mem::size_of::<T>() + obj.retained_size();
        let idx = self.slots.len() as u32;
        self.slots.push(Slot::Obj(obj));
        GcRef(idx)
    }

    pub fn get(&self, r: GcRef) -> &T {
        match &self.slots[r.index()] {
            Slot::Obj(o) => o,
            _ => panic!("heap: dangling reference {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut T {
        match &mut self.slots[r.index()] {
            Slot::Obj(o) => o,
            _ => panic!("heap: dangling reference {:?}", r),
        }
    }

    /// Pin an object so it survives collections without being reachable
    /// from the owner's roots.
    pub fn register_global_root(&mut self, r: GcRef) -> RootHandle {
        if let Some(idx) = self.free_roots.pop() {
            self.roots[idx] = Some(r);
            RootHandle(idx)
        } else {
            self.roots.push(Some(r));
            RootHandle(self.roots.len() - 1)
        }
    }

    pub fn deregister_global_root(&mut self, h: RootHandle) {
        if self.roots[h.0].take().is_some() {
            self.free_roots.push(h.0);
        }
    }

    /// Whether the allocation budget has been exceeded since the last
    /// collection. Checked by the owner at safe points.
    pub fn should_collect(&self) -> bool {
        self.since_gc >= self.budget
    }

    /// Number of slots currently held (live objects plus garbage not yet
    /// collected).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Evacuate the live set into a fresh space.
    ///
    /// `trace_roots` must invoke its argument on every root reference the
    /// owner holds; each is rewritten to the object's new location.
    /// Unreachable objects that want finalization are finalized before the
    /// old space is dropped.
    pub fn collect<F>(&mut self, trace_roots: F)
    where
        F: FnOnce(&mut dyn FnMut(&mut GcRef)),
    {
        let old_len = self.slots.len();
        let mut from = mem::take(&mut self.slots);
        let mut to: Vec<Slot<T>> = Vec::with_capacity(old_len / 2 + 1);

        {
            let mut fwd = |r: &mut GcRef| *r = forward(&mut from, &mut to, *r);
            for root in self.roots.iter_mut().flatten() {
                fwd(root);
            }
            trace_roots(&mut fwd);
        }

        // Cheney scan: objects appended to to-space still hold from-space
        // references until their turn comes.
        let mut scan = 0;
        while scan < to.len() {
            let mut obj = match mem::replace(&mut to[scan], Slot::Moved) {
                Slot::Obj(o) => o,
                _ => panic!("heap: scan reached a non-object slot"),
            };
            obj.update_refs(&mut |r| *r = forward(&mut from, &mut to, *r));
            to[scan] = Slot::Obj(obj);
            scan += 1;
        }

        for slot in &mut from {
            if let Slot::Obj(o) = slot {
                if o.needs_finalize() {
                    o.finalize();
                }
            }
        }
        drop(from);

        self.stats.collections += 1;
        self.stats.live = to.len();
        self.stats.reclaimed = old_len - to.len();
        self.since_gc = 0;
        self.slots = to;

        debug!(
            live = self.stats.live,
            reclaimed = self.stats.reclaimed,
            "heap collection"
        );
    }
}

impl<T: Shape> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Evacuate the object at `r` if it has not moved yet; return its to-space
/// location either way.
fn forward<T: Shape>(from: &mut [Slot<T>], to: &mut Vec<Slot<T>>, r: GcRef) -> GcRef {
    let i = r.index();
    match &from[i] {
        Slot::Forward(j) => GcRef(*j),
        Slot::Obj(_) => {
            let j = to.len() as u32;
            if let Slot::Obj(o) = mem::replace(&mut from[i], Slot::Forward(j)) {
                to.push(Slot::Obj(o));
            }
            GcRef(j)
        }
        Slot::Moved => panic!("heap: forwarding hit a slot under field update"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A test object: a name plus references to other nodes.
    struct Node {
        name: &'static str,
        edges: Vec<GcRef>,
        finalized: bool,
    }

    impl Node {
        fn leaf(name: &'static str) -> Self {
            Node {
                name,
                edges: Vec::new(),
                finalized: false,
            }
        }
    }

    impl Shape for Node {
        fn update_refs(&mut self, f: &mut dyn FnMut(&mut GcRef)) {
            for e in &mut self.edges {
                f(e);
            }
        }

        fn retained_size(&self) -> usize {
            self.edges.len() * mem::size_of::<GcRef>()
        }

        fn needs_finalize(&self) -> bool {
            true
        }

        fn finalize(&mut self) {
            self.finalized = true;
        }
    }

    #[test]
    fn test_alloc_and_get() {
        let mut heap: Heap<Node> = Heap::new();
        let a = heap.alloc(Node::leaf("a"));
        assert_eq!(heap.get(a).name, "a");
        heap.get_mut(a).name = "b";
        assert_eq!(heap.get(a).name, "b");
    }

    #[test]
    fn test_collect_drops_unreachable() {
        let mut heap: Heap<Node> = Heap::new();
        let keep = heap.alloc(Node::leaf("keep"));
        let _dead = heap.alloc(Node::leaf("dead"));

        let mut root = keep;
        heap.collect(|f| f(&mut root));

        assert_eq!(heap.len(), 1);
        assert_eq!(heap.get(root).name, "keep");
        assert_eq!(heap.stats().reclaimed, 1);
    }

    #[test]
    fn test_collect_rewrites_edges() {
        let mut heap: Heap<Node> = Heap::new();
        let _garbage = heap.alloc(Node::leaf("g0"));
        let leaf = heap.alloc(Node::leaf("leaf"));
        let mut parent = Node::leaf("parent");
        parent.edges.push(leaf);
        let parent = heap.alloc(parent);

        let mut root = parent;
        heap.collect(|f| f(&mut root));

        // The parent moved; its edge must point at the relocated leaf.
        let edge = heap.get(root).edges[0];
        assert_eq!(heap.get(edge).name, "leaf");
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn test_shared_object_forwarded_once() {
        let mut heap: Heap<Node> = Heap::new();
        let shared = heap.alloc(Node::leaf("shared"));
        let mut a = Node::leaf("a");
        a.edges.push(shared);
        let a = heap.alloc(a);
        let mut b = Node::leaf("b");
        b.edges.push(shared);
        let b = heap.alloc(b);

        let mut roots = [a, b];
        heap.collect(|f| {
            for r in &mut roots {
                f(r);
            }
        });

        assert_eq!(heap.len(), 3);
        let ea = heap.get(roots[0]).edges[0];
        let eb = heap.get(roots[1]).edges[0];
        assert_eq!(ea, eb);
        assert_eq!(heap.get(ea).name, "shared");
    }

    #[test]
    fn test_global_roots_survive() {
        let mut heap: Heap<Node> = Heap::new();
        let pinned = heap.alloc(Node::leaf("pinned"));
        let h = heap.register_global_root(pinned);

        heap.collect(|_| {});
        assert_eq!(heap.len(), 1);

        heap.deregister_global_root(h);
        heap.collect(|_| {});
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn test_cycle_collected_once_unrooted() {
        let mut heap: Heap<Node> = Heap::new();
        let a = heap.alloc(Node::leaf("a"));
        let b = heap.alloc(Node::leaf("b"));
        heap.get_mut(a).edges.push(b);
        heap.get_mut(b).edges.push(a);

        let mut root = a;
        heap.collect(|f| f(&mut root));
        assert_eq!(heap.len(), 2);

        // Drop the root: the cycle is unreachable and must go.
        heap.collect(|_| {});
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn test_budget_requests_collection() {
        let mut heap: Heap<Node> = Heap::with_budget(1);
        assert!(!heap.should_collect());
        let _ = heap.alloc(Node::leaf("x"));
        assert!(heap.should_collect());
        heap.collect(|_| {});
        assert!(!heap.should_collect());
    }
}
