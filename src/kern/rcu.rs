//! RCU - Read-Copy-Update
//!
//! Readers run with DPCs disabled, which keeps their CPU from passing
//! through a quiescent state (a context switch) until they finish. A writer
//! unpublishes an object and registers a callback that frees it; the
//! callback runs once every participating CPU has quiesced after the
//! registration.
//!
//! ## Generations
//!
//! A global generation counter numbers grace periods. Callbacks registered
//! while generation `g` is current go on the list for `g + 1`. When the last
//! participating CPU reports that it has seen `g`, generation `g` closes: the
//! counter moves to `g + 1` and the list for `g` is handed to the CPU that
//! closed it, which runs it from its RCU DPC. Lists live in a ring of
//! `RCU_GENERATION_RING` Treiber stacks indexed by generation.
//!
//! ## Combining tree
//!
//! Quiescence reports are combined in a tree over the CPUs (a power of two
//! of leaves). Every node records the last generation its whole subtree has
//! seen and whether any CPU below it participates; an internal node is
//! always derived from its two children. Each pair of siblings is guarded
//! by one spin lock, kept in the parent's slot, and the root lives in slot
//! zero.
//!
//! A CPU changes its leaf and climbs with lock coupling: it keeps the lock
//! of a sibling pair until it holds the lock of the pair above, recomputes
//! the parent and stops as soon as the parent does not change. Whoever
//! changes the root holds the root lock and closes the generation if every
//! participating CPU has seen it.
//!
//! Idle CPUs leave the tree (`disable`) and rejoin (`enable`). Leaving can
//! complete a generation the rest of the tree was waiting on, so it goes
//! through the same climb.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use log::trace;

use crate::config::RCU_GENERATION_RING;
use crate::kern::dpc::PendingWork;
use crate::kern::event::Event;
use crate::kern::percpu::{CacheAligned, PerCpu};
use crate::kern::sched_prim::Blocker;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::CpuId;

const RING_MASK: u64 = RCU_GENERATION_RING as u64 - 1;

/// Deferred reclamation work
pub type RcuCallback<C> = Box<dyn FnOnce(&C) + Send>;

struct RcuHead<C> {
    next: *mut RcuHead<C>,
    func: RcuCallback<C>,
}

/// Callbacks handed to a CPU, waiting for its RCU DPC
struct Batch<C>(*mut RcuHead<C>);

// The batch owns its nodes exclusively and the callbacks are `Send`.
unsafe impl<C> Send for Batch<C> {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Segment {
    /// Last generation this subtree has completely seen
    generation: u64,
    /// Some CPU below participates
    active: bool,
}

impl Segment {
    /// State of a parent node with children `a` and `b`
    fn combine(a: Segment, b: Segment) -> Segment {
        match (a.active, b.active) {
            (true, true) => Segment {
                generation: a.generation.min(b.generation),
                active: true,
            },
            (true, false) => a,
            (false, true) => b,
            (false, false) => Segment::default(),
        }
    }
}

/// Grace-period tracker for `nr_cpus` processors
pub struct Rcu<C> {
    generation: AtomicU64,
    /// Number of leaves; leaf of CPU `c` is node `leaves + c`
    leaves: usize,
    /// `pairs[p]` holds the segments of nodes `2p` and `2p + 1`
    pairs: Box<[CacheAligned<spin::Mutex<[Segment; 2]>>]>,
    lists: [AtomicPtr<RcuHead<C>>; RCU_GENERATION_RING],
    dispatch: PerCpu<spin::Mutex<Batch<C>>>,
}

impl<C> Rcu<C> {
    pub fn new(nr_cpus: usize) -> Self {
        let leaves = nr_cpus.next_power_of_two().max(2);
        Self {
            generation: AtomicU64::new(1),
            leaves,
            pairs: (0..leaves)
                .map(|_| CacheAligned(spin::Mutex::new([Segment::default(); 2])))
                .collect(),
            lists: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            dispatch: PerCpu::new(nr_cpus, |_| spin::Mutex::new(Batch(ptr::null_mut()))),
        }
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `cpu` participates in grace periods
    pub fn is_active(&self, cpu: CpuId) -> bool {
        let idx = self.leaf(cpu);
        self.pairs[idx >> 1].lock()[idx & 1].active
    }

    fn leaf(&self, cpu: CpuId) -> usize {
        assert!(cpu.index() < self.dispatch.len(), "rcu: {} out of range", cpu);
        self.leaves + cpu.index()
    }

    /// Register `func` to run after the next full grace period
    ///
    /// The caller must be inside a read-side section so the generation it
    /// reads cannot close before the callback is linked.
    pub fn call(&self, func: impl FnOnce(&C) + Send + 'static) {
        let target = self.generation.load(Ordering::Acquire) + 1;
        let list = &self.lists[(target & RING_MASK) as usize];
        let node = Box::into_raw(Box::new(RcuHead {
            next: ptr::null_mut(),
            func: Box::new(func),
        }));
        let mut head = list.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is ours until the CAS publishes it.
            unsafe { (*node).next = head };
            match list.compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Report a quiescent state on `cpu`
    ///
    /// Returns true if callbacks were handed to `cpu` for its RCU DPC.
    pub fn quiesce(&self, cpu: CpuId) -> bool {
        self.update_leaf(cpu, |leaf, cur| {
            if !leaf.active || leaf.generation >= cur {
                return false;
            }
            leaf.generation = cur;
            true
        })
    }

    /// Start taking part in grace periods
    pub fn enable(&self, cpu: CpuId) -> bool {
        self.set_participation(cpu, true)
    }

    /// Stop taking part in grace periods (idle CPU)
    pub fn disable(&self, cpu: CpuId) -> bool {
        self.set_participation(cpu, false)
    }

    fn set_participation(&self, cpu: CpuId, active: bool) -> bool {
        self.update_leaf(cpu, |leaf, cur| {
            assert!(
                leaf.active != active,
                "rcu: {} already {}",
                cpu,
                if active { "enabled" } else { "disabled" }
            );
            leaf.active = active;
            if active {
                leaf.generation = cur;
            }
            true
        })
    }

    /// Apply `update` to the leaf of `cpu` and carry the change towards the
    /// root; `update` returns false when it changed nothing
    fn update_leaf(&self, cpu: CpuId, update: impl FnOnce(&mut Segment, u64) -> bool) -> bool {
        let mut idx = self.leaf(cpu);
        let mut pair = self.pairs[idx >> 1].lock();
        let cur = self.generation.load(Ordering::Acquire);
        if !update(&mut pair[idx & 1], cur) {
            return false;
        }
        while idx > 1 {
            let parent = idx >> 1;
            let derived = Segment::combine(pair[0], pair[1]);
            let mut up = self.pairs[parent >> 1].lock();
            if up[parent & 1] == derived {
                return false;
            }
            up[parent & 1] = derived;
            // Released only now that the pair above is held.
            pair = up;
            idx = parent;
        }
        // `pair` is slot zero: the root, under the lock every close takes.
        let root = pair[1];
        let cur = self.generation.load(Ordering::Acquire);
        if root.active && root.generation < cur {
            return false;
        }
        self.close_generation(cur, cpu)
    }

    fn close_generation(&self, cur: u64, cpu: CpuId) -> bool {
        if self
            .generation
            .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let list = self.lists[(cur & RING_MASK) as usize].swap(ptr::null_mut(), Ordering::Acquire);
        trace!("rcu: generation {} closed on {}", cur, cpu);
        if list.is_null() {
            return false;
        }
        // The stack is newest-first; callbacks run in registration order.
        let mut fifo = ptr::null_mut();
        let mut node = list;
        // SAFETY: the swapped-out list and the dispatch batch are exclusively
        // ours (the latter under its lock).
        unsafe {
            while !node.is_null() {
                let next = (*node).next;
                (*node).next = fifo;
                fifo = node;
                node = next;
            }
            let mut batch = self.dispatch[cpu].lock();
            if batch.0.is_null() {
                batch.0 = fifo;
            } else {
                let mut tail = batch.0;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = fifo;
            }
        }
        true
    }

    /// Run the callbacks handed to `cpu`; returns how many ran
    pub fn run_callbacks(&self, cpu: CpuId, ctx: &C) -> usize {
        let mut head = core::mem::replace(&mut self.dispatch[cpu].lock().0, ptr::null_mut());
        let mut ran = 0;
        while !head.is_null() {
            // SAFETY: nodes come from `Box::into_raw` in `call` and are
            // reachable from exactly one list.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            (node.func)(ctx);
            ran += 1;
        }
        ran
    }
}

impl<C: Blocker> Rcu<C> {
    /// Block until every callback registered before this call has run
    pub fn barrier(&self, ctx: &C) {
        let done = alloc::sync::Arc::new(Event::new());
        let signal = alloc::sync::Arc::clone(&done);
        ctx.disable_dpc();
        self.call(move |ctx: &C| signal.set(ctx));
        ctx.enable_dpc();
        done.wait(ctx);
    }
}

fn free_list<C>(mut head: *mut RcuHead<C>) {
    while !head.is_null() {
        // SAFETY: as in `run_callbacks`.
        let node = unsafe { Box::from_raw(head) };
        head = node.next;
    }
}

impl<C> Drop for Rcu<C> {
    fn drop(&mut self) {
        for list in &self.lists {
            free_list(list.swap(ptr::null_mut(), Ordering::Acquire));
        }
        for (_, batch) in self.dispatch.iter() {
            free_list(core::mem::replace(&mut batch.lock().0, ptr::null_mut()));
        }
    }
}

// ============================================================================
// Kernel read-side API
// ============================================================================

impl<P: Platform> Kernel<P> {
    pub fn rcu_read_lock(&self) {
        self.disable_dpc();
    }

    pub fn rcu_read_unlock(&self) {
        self.enable_dpc();
    }

    /// Rejoin grace-period tracking on the calling CPU
    pub fn rcu_enable(&self) {
        let cpu = self.cpu_id();
        if self.rcu.enable(cpu) {
            self.raise(cpu, PendingWork::RCU);
        }
    }

    /// Stop holding up grace periods on the calling CPU
    pub fn rcu_disable(&self) {
        let cpu = self.cpu_id();
        if self.rcu.disable(cpu) {
            self.raise(cpu, PendingWork::RCU);
        }
    }

    /// Run `func` after a grace period, from the RCU DPC of some CPU
    pub fn rcu_call(&self, func: impl FnOnce(&Self) + Send + 'static) {
        self.rcu_read_lock();
        self.rcu.call(func);
        self.rcu_read_unlock();
    }

    /// Wait for all previously registered callbacks
    pub fn rcu_barrier(&self) {
        self.rcu.barrier(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, AtomicUsize};

    use crate::config::KernelConfig;
    use crate::platform::sim::SimPlatform;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&c), c)
    }

    #[test]
    fn test_callback_waits_for_every_cpu() {
        let rcu: Rcu<()> = Rcu::new(2);
        rcu.enable(CpuId(0));
        rcu.enable(CpuId(1));
        let (fired, seen) = counter();
        rcu.call(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            if rcu.quiesce(CpuId(0)) {
                rcu.run_callbacks(CpuId(0), &());
            }
        }
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        assert!(rcu.quiesce(CpuId(1)));
        assert_eq!(rcu.run_callbacks(CpuId(1), &()), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_sibling_does_not_stall() {
        let rcu: Rcu<()> = Rcu::new(2);
        rcu.enable(CpuId(0));
        rcu.enable(CpuId(1));
        let (fired, seen) = counter();
        rcu.call(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        rcu.quiesce(CpuId(0));
        rcu.quiesce(CpuId(0));

        // CPU 0 already waits on CPU 1, which now goes idle.
        assert!(rcu.disable(CpuId(1)));
        assert_eq!(rcu.run_callbacks(CpuId(1), &()), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!rcu.is_active(CpuId(1)));
    }

    #[test]
    fn test_single_cpu_makes_progress_alone() {
        let rcu: Rcu<()> = Rcu::new(1);
        rcu.enable(CpuId(0));
        let (fired, seen) = counter();
        rcu.call(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        let mut ran = 0;
        for _ in 0..3 {
            if rcu.quiesce(CpuId(0)) {
                ran += rcu.run_callbacks(CpuId(0), &());
            }
        }
        assert_eq!(ran, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deep_tree_needs_all_leaves() {
        let rcu: Rcu<()> = Rcu::new(5);
        for cpu in 0..5 {
            rcu.enable(CpuId(cpu));
        }
        let start = rcu.generation();
        for cpu in 0..4 {
            rcu.quiesce(CpuId(cpu));
        }
        // Generation `start` still needs CPU 4.
        assert!(rcu.generation() <= start + 1);
        for round in 0..3 {
            for cpu in 0..5 {
                rcu.quiesce(CpuId(cpu));
            }
            assert!(rcu.generation() > start + round);
        }
    }

    #[test]
    fn test_dispatched_batches_chain() {
        let rcu: Rcu<()> = Rcu::new(1);
        rcu.enable(CpuId(0));
        let (fired, seen) = counter();
        for _ in 0..3 {
            let f = Arc::clone(&fired);
            rcu.call(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
            rcu.quiesce(CpuId(0));
        }
        for _ in 0..3 {
            rcu.quiesce(CpuId(0));
        }
        assert_eq!(rcu.run_callbacks(CpuId(0), &()), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let rcu: Rcu<()> = Rcu::new(1);
        rcu.enable(CpuId(0));
        let order = Arc::new(spin::Mutex::new(alloc::vec::Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            rcu.call(move |_| order.lock().push(i));
            if i == 1 {
                rcu.quiesce(CpuId(0));
            }
        }
        for _ in 0..4 {
            rcu.quiesce(CpuId(0));
        }
        rcu.run_callbacks(CpuId(0), &());
        assert_eq!(*order.lock(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_drop_frees_pending_callbacks() {
        let rcu: Rcu<()> = Rcu::new(2);
        let payload = Arc::new(());
        let held = Arc::clone(&payload);
        rcu.call(move |_| drop(held));
        drop(rcu);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    #[should_panic(expected = "already enabled")]
    fn test_double_enable_panics() {
        let rcu: Rcu<()> = Rcu::new(2);
        rcu.enable(CpuId(0));
        rcu.enable(CpuId(0));
    }

    #[test]
    fn test_concurrent_enable_disable_keeps_grace_periods() {
        use alloc::vec::Vec;
        use std::thread;

        const CPUS: usize = 4;
        const PASSES: usize = 20_000;

        let rcu: Arc<Rcu<()>> = Arc::new(Rcu::new(CPUS));
        for cpu in 0..CPUS {
            rcu.enable(CpuId(cpu as u32));
        }
        // Read-side sections opened and closed per CPU.
        let starts: Arc<Vec<AtomicUsize>> = Arc::new((0..CPUS).map(|_| AtomicUsize::new(0)).collect());
        let ends: Arc<Vec<AtomicUsize>> = Arc::new((0..CPUS).map(|_| AtomicUsize::new(0)).collect());
        let early = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CPUS)
            .map(|c| {
                let (rcu, starts, ends) = (Arc::clone(&rcu), Arc::clone(&starts), Arc::clone(&ends));
                let (early, ran) = (Arc::clone(&early), Arc::clone(&ran));
                thread::spawn(move || {
                    let cpu = CpuId(c as u32);
                    for pass in 0..PASSES {
                        starts[c].fetch_add(1, Ordering::SeqCst);
                        let snap: Vec<usize> = starts.iter().map(|s| s.load(Ordering::SeqCst)).collect();
                        let (ends_seen, early, ran) = (Arc::clone(&ends), Arc::clone(&early), Arc::clone(&ran));
                        rcu.call(move |_| {
                            // Every section open at registration must have closed.
                            for (j, &opened) in snap.iter().enumerate() {
                                if ends_seen[j].load(Ordering::SeqCst) < opened {
                                    early.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            ran.fetch_add(1, Ordering::SeqCst);
                        });
                        ends[c].fetch_add(1, Ordering::SeqCst);

                        let mut handed = false;
                        if pass % 3 == 2 {
                            handed |= rcu.disable(cpu);
                            handed |= rcu.enable(cpu);
                        } else {
                            handed |= rcu.quiesce(cpu);
                        }
                        if handed {
                            rcu.run_callbacks(cpu, &());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(early.load(Ordering::SeqCst), 0);
        assert!(ran.load(Ordering::SeqCst) > 0);
        for cpu in 0..CPUS {
            assert!(rcu.is_active(CpuId(cpu as u32)));
        }
    }

    #[test]
    fn test_last_cpu_leaving_closes_generation() {
        let rcu: Rcu<()> = Rcu::new(4);
        for cpu in 0..4 {
            rcu.enable(CpuId(cpu));
        }
        let (fired, seen) = counter();
        rcu.call(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        for cpu in 0..4 {
            rcu.quiesce(CpuId(cpu));
        }
        // CPUs in both halves of the tree go idle; the last one out closes.
        let mut handed = 0;
        for cpu in [1, 2, 0, 3] {
            if rcu.disable(CpuId(cpu)) {
                handed += rcu.run_callbacks(CpuId(cpu), &());
            }
        }
        assert_eq!(handed, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kernel_grace_period_waits_for_reader() {
        let k = Kernel::new(KernelConfig::new().with_cpus(2), SimPlatform::new(2)).unwrap();
        for cpu in 0..2 {
            k.platform().set_cpu(CpuId(cpu));
            k.start_cpu().unwrap();
        }

        // A reader on CPU 1 holds a pointer to the old version.
        let old = Box::into_raw(Box::new(1u64));
        let shared = Arc::new(AtomicPtr::new(old));
        k.platform().set_cpu(CpuId(1));
        k.rcu_read_lock();
        let seen = shared.load(Ordering::Acquire);

        // Writer on CPU 0 publishes a new version and defers the free.
        k.platform().set_cpu(CpuId(0));
        let prev = shared.swap(Box::into_raw(Box::new(2u64)), Ordering::AcqRel) as usize;
        let freed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&freed);
        k.rcu_call(move |_| {
            // SAFETY: the grace period has ended; no reader holds `prev`.
            drop(unsafe { Box::from_raw(prev as *mut u64) });
            flag.store(true, Ordering::Release);
        });
        for _ in 0..4 {
            k.schedule();
        }
        assert!(!freed.load(Ordering::Acquire));
        // SAFETY: still inside the read-side section.
        assert_eq!(unsafe { *seen }, 1);

        k.platform().set_cpu(CpuId(1));
        k.rcu_read_unlock();
        k.schedule();
        assert!(freed.load(Ordering::Acquire));

        // SAFETY: the current version is only freed here.
        drop(unsafe { Box::from_raw(shared.load(Ordering::Acquire)) });
    }
}
