//! VMA Tree - augmented AVL interval tree
//!
//! Keeps a set of disjoint closed intervals `[first, last]` ordered by
//! `first`. Every node additionally records
//!
//! - `prev_gap`: free space between the node and its in-order predecessor
//!   (`first - pred.last - 1`, or `first` for the lowest node), and
//! - `biggest_gap`: the largest `prev_gap` in the subtree rooted at the node,
//!
//! which lets the free-range searches skip whole subtrees that cannot hold a
//! request. Nodes are also threaded on a sorted doubly linked list so that
//! predecessor and successor lookups are O(1).
//!
//! Nodes live in an arena owned by the tree and are named by `VmaId`
//! handles, which stay valid until the node is removed. The payload `T`
//! belongs to whichever subsystem owns the intervals (kernel vmap areas,
//! user VMAs).

use alloc::vec::Vec;
use core::cmp::max;

use thiserror::Error;

/// Highest address representable in the tree
pub const VMA_TREE_MAX: u64 = u64::MAX;

const LEFT: usize = 0;
const RIGHT: usize = 1;

// ============================================================================
// Nodes
// ============================================================================

/// Handle to a node in a `VmaTree`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmaId(u32);

#[derive(Debug)]
struct VmaNode<T> {
    first: u64,
    last: u64,
    prev_gap: u64,
    biggest_gap: u64,
    height: i32,
    parent: Option<u32>,
    child: [Option<u32>; 2],
    prev: Option<u32>,
    next: Option<u32>,
    value: T,
}

/// A borrowed view of one interval
#[derive(Debug, Clone, Copy)]
pub struct VmaEntry<'a, T> {
    pub id: VmaId,
    pub first: u64,
    pub last: u64,
    pub value: &'a T,
}

/// Structural damage found by `VmaTree::check_invariants`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("node {0} has a wrong parent link")]
    ParentLink(u32),
    #[error("node {0} is out of order or overlaps its predecessor")]
    Order(u32),
    #[error("node {0} has a stale height")]
    Height(u32),
    #[error("node {0} is unbalanced")]
    Unbalanced(u32),
    #[error("node {0} has a stale prev_gap")]
    PrevGap(u32),
    #[error("node {0} has a stale biggest_gap")]
    BiggestGap(u32),
    #[error("sorted list disagrees with the tree")]
    List,
    #[error("tree holds {found} nodes but counts {expected}")]
    Count { expected: usize, found: usize },
}

// ============================================================================
// Tree
// ============================================================================

/// Augmented AVL tree of disjoint intervals
#[derive(Debug)]
pub struct VmaTree<T> {
    nodes: Vec<Option<VmaNode<T>>>,
    free: Vec<u32>,
    root: Option<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

#[derive(Clone, Copy)]
enum Walk {
    Descend,
    Visit,
    Next,
    Ascend,
}

impl<T> Default for VmaTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> VmaTree<T> {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ------------------------------------------------------------------------
    // Arena access
    // ------------------------------------------------------------------------

    fn node(&self, i: u32) -> &VmaNode<T> {
        match self.nodes.get(i as usize) {
            Some(Some(n)) => n,
            _ => panic!("stale VMA handle {}", i),
        }
    }

    fn node_mut(&mut self, i: u32) -> &mut VmaNode<T> {
        match self.nodes.get_mut(i as usize) {
            Some(Some(n)) => n,
            _ => panic!("stale VMA handle {}", i),
        }
    }

    fn height(&self, i: Option<u32>) -> i32 {
        i.map_or(0, |i| self.node(i).height)
    }

    fn biggest(&self, i: Option<u32>) -> u64 {
        i.map_or(0, |i| self.node(i).biggest_gap)
    }

    fn balance(&self, i: u32) -> i32 {
        let n = self.node(i);
        self.height(n.child[RIGHT]) - self.height(n.child[LEFT])
    }

    /// First address after the predecessor (0 if there is none)
    fn prev_end(&self, i: u32) -> u64 {
        match self.node(i).prev {
            Some(p) => self.node(p).last + 1,
            None => 0,
        }
    }

    fn gap_before(&self, i: u32) -> u64 {
        self.node(i).first - self.prev_end(i)
    }

    /// Recompute height and biggest_gap from the children
    fn propagate(&mut self, i: u32) {
        let n = self.node(i);
        let (l, r) = (n.child[LEFT], n.child[RIGHT]);
        let height = 1 + max(self.height(l), self.height(r));
        let biggest = max(n.prev_gap, max(self.biggest(l), self.biggest(r)));
        let n = self.node_mut(i);
        n.height = height;
        n.biggest_gap = biggest;
    }

    fn propagate_up(&mut self, mut cur: Option<u32>) {
        while let Some(i) = cur {
            self.propagate(i);
            cur = self.node(i).parent;
        }
    }

    /// Point `parent`'s link to `old` (or the root) at `new`
    fn replace_child(&mut self, parent: Option<u32>, old: u32, new: Option<u32>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let pn = self.node_mut(p);
                if pn.child[LEFT] == Some(old) {
                    pn.child[LEFT] = new;
                } else {
                    pn.child[RIGHT] = new;
                }
            }
        }
        if let Some(n) = new {
            self.node_mut(n).parent = parent;
        }
    }

    // ------------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------------

    /// Rotate `node` so that its `1 - dir` child takes its place
    ///
    /// The caller links the returned node into `node`'s old parent.
    fn rotate(&mut self, node: u32, dir: usize) -> u32 {
        let oth = 1 - dir;
        let Some(z) = self.node(node).child[oth] else {
            unreachable!("rotation of VMA node {} without a child", node);
        };
        let tmp = self.node(z).child[dir];
        self.node_mut(node).child[oth] = tmp;
        if let Some(t) = tmp {
            self.node_mut(t).parent = Some(node);
        }
        self.node_mut(z).child[dir] = Some(node);
        self.node_mut(node).parent = Some(z);
        self.propagate(node);
        self.propagate(z);
        z
    }

    /// Restore balance and gap data from `start` up to the root
    fn fixup(&mut self, start: Option<u32>) {
        let mut cur = start;
        while let Some(node) = cur {
            let bal = self.balance(node);
            let parent = self.node(node).parent;
            if (-1..=1).contains(&bal) {
                self.propagate(node);
                cur = parent;
                continue;
            }

            let dir = if bal > 0 { RIGHT } else { LEFT };
            let Some(z) = self.node(node).child[dir] else {
                unreachable!("VMA node {} is heavy on an empty side", node);
            };
            let zbal = self.balance(z);
            if (dir == LEFT && zbal > 0) || (dir == RIGHT && zbal < 0) {
                let nz = self.rotate(z, dir);
                self.node_mut(nz).parent = Some(node);
                self.node_mut(node).child[dir] = Some(nz);
            }
            let top = self.rotate(node, 1 - dir);
            self.replace_child(parent, node, Some(top));
            cur = parent;
        }
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Insert `[first, last]` carrying `value`
    ///
    /// The interval must not overlap any interval already in the tree.
    pub fn insert(&mut self, first: u64, last: u64, value: T) -> VmaId {
        assert!(first <= last, "inverted VMA range {:#x}..={:#x}", first, last);

        let mut parent = None;
        let mut side = LEFT;
        let mut pred = None;
        let mut succ = None;
        let mut cur = self.root;
        while let Some(c) = cur {
            parent = Some(c);
            let n = self.node(c);
            if first < n.first {
                succ = Some(c);
                side = LEFT;
                cur = n.child[LEFT];
            } else {
                pred = Some(c);
                side = RIGHT;
                cur = n.child[RIGHT];
            }
        }

        if let Some(p) = pred {
            let p = self.node(p);
            assert!(
                p.last < first,
                "VMA {:#x}..={:#x} overlaps {:#x}..={:#x}",
                first,
                last,
                p.first,
                p.last
            );
        }
        if let Some(s) = succ {
            let s = self.node(s);
            assert!(
                last < s.first,
                "VMA {:#x}..={:#x} overlaps {:#x}..={:#x}",
                first,
                last,
                s.first,
                s.last
            );
        }

        let node = VmaNode {
            first,
            last,
            prev_gap: 0,
            biggest_gap: 0,
            height: 1,
            parent,
            child: [None, None],
            prev: pred,
            next: succ,
            value,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };

        match pred {
            Some(p) => self.node_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        match succ {
            Some(s) => self.node_mut(s).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        match parent {
            Some(p) => self.node_mut(p).child[side] = Some(idx),
            None => self.root = Some(idx),
        }

        let gap = self.gap_before(idx);
        let n = self.node_mut(idx);
        n.prev_gap = gap;
        n.biggest_gap = gap;
        if let Some(s) = succ {
            // The successor is an ancestor of the new leaf, so the fixup
            // below recomputes its subtree data.
            let gap = self.gap_before(s);
            self.node_mut(s).prev_gap = gap;
        }

        self.fixup(Some(idx));
        self.len += 1;
        VmaId(idx)
    }

    /// Remove a node and return its payload
    pub fn remove(&mut self, id: VmaId) -> T {
        let node = id.0;
        let n = self.node(node);
        let (parent, left, right) = (n.parent, n.child[LEFT], n.child[RIGHT]);
        let (prev, next) = (n.prev, n.next);

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(s) => self.node_mut(s).prev = prev,
            None => self.tail = prev,
        }
        if let Some(s) = next {
            let gap = self.gap_before(s);
            self.node_mut(s).prev_gap = gap;
        }

        let fix_from = match (left, right) {
            (_, None) => {
                self.replace_child(parent, node, left);
                parent
            }
            (None, Some(r)) => {
                self.replace_child(parent, node, Some(r));
                // The successor is the leftmost node of the right subtree.
                next
            }
            (Some(l), Some(r)) => {
                let Some(z) = next else {
                    unreachable!("VMA node {} has a right subtree but no successor", node);
                };
                let Some(y) = self.node(z).parent else {
                    unreachable!("successor of VMA node {} is the root", node);
                };
                self.node_mut(z).child[LEFT] = Some(l);
                self.node_mut(l).parent = Some(z);
                let fix_from = if y == node {
                    Some(z)
                } else {
                    let zr = self.node(z).child[RIGHT];
                    self.node_mut(y).child[LEFT] = zr;
                    if let Some(zr) = zr {
                        self.node_mut(zr).parent = Some(y);
                    }
                    self.node_mut(z).child[RIGHT] = Some(r);
                    self.node_mut(r).parent = Some(z);
                    Some(y)
                };
                self.replace_child(parent, node, Some(z));
                fix_from
            }
        };

        self.fixup(fix_from);
        self.len -= 1;
        self.free.push(node);
        match self.nodes[node as usize].take() {
            Some(n) => n.value,
            None => unreachable!(),
        }
    }

    /// Move a live node to `[first, last]` without reinserting it
    ///
    /// The new bounds must keep the node between its current neighbours.
    pub fn adjust(&mut self, id: VmaId, first: u64, last: u64) {
        let node = id.0;
        assert!(first <= last, "inverted VMA range {:#x}..={:#x}", first, last);
        let (prev, next) = (self.node(node).prev, self.node(node).next);
        if let Some(p) = prev {
            assert!(self.node(p).last < first, "adjusted VMA overlaps its predecessor");
        }
        if let Some(s) = next {
            assert!(last < self.node(s).first, "adjusted VMA overlaps its successor");
        }

        let n = self.node_mut(node);
        n.first = first;
        n.last = last;
        let gap = self.gap_before(node);
        self.node_mut(node).prev_gap = gap;

        let start = match next {
            Some(s) => {
                let gap = self.gap_before(s);
                self.node_mut(s).prev_gap = gap;
                if self.node(s).height < self.node(node).height {
                    s
                } else {
                    node
                }
            }
            None => node,
        };
        self.propagate_up(Some(start));
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Node containing `addr`
    pub fn find(&self, addr: u64) -> Option<VmaId> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            if addr < n.first {
                cur = n.child[LEFT];
            } else if addr > n.last {
                cur = n.child[RIGHT];
            } else {
                return Some(VmaId(c));
            }
        }
        None
    }

    /// Lowest node that contains `addr` or lies above it
    pub fn find_above(&self, addr: u64) -> Option<VmaId> {
        let mut cur = self.root;
        let mut found = None;
        while let Some(c) = cur {
            let n = self.node(c);
            if addr > n.last {
                cur = n.child[RIGHT];
            } else {
                found = Some(VmaId(c));
                cur = n.child[LEFT];
            }
        }
        found
    }

    /// Highest node that starts below `addr`
    pub fn find_below(&self, addr: u64) -> Option<VmaId> {
        let mut cur = self.root;
        let mut found = None;
        while let Some(c) = cur {
            let n = self.node(c);
            if addr <= n.first {
                cur = n.child[LEFT];
            } else {
                found = Some(VmaId(c));
                cur = n.child[RIGHT];
            }
        }
        found
    }

    pub fn range(&self, id: VmaId) -> (u64, u64) {
        let n = self.node(id.0);
        (n.first, n.last)
    }

    pub fn get(&self, id: VmaId) -> &T {
        &self.node(id.0).value
    }

    pub fn get_mut(&mut self, id: VmaId) -> &mut T {
        &mut self.node_mut(id.0).value
    }

    pub fn first(&self) -> Option<VmaId> {
        self.head.map(VmaId)
    }

    pub fn last(&self) -> Option<VmaId> {
        self.tail.map(VmaId)
    }

    pub fn next(&self, id: VmaId) -> Option<VmaId> {
        self.node(id.0).next.map(VmaId)
    }

    pub fn prev(&self, id: VmaId) -> Option<VmaId> {
        self.node(id.0).prev.map(VmaId)
    }

    /// Intervals in ascending address order
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            tree: self,
            cur: self.head,
        }
    }

    // ------------------------------------------------------------------------
    // Free range search
    // ------------------------------------------------------------------------

    /// Lowest `align`-aligned address `a >= min_addr` such that
    /// `[a, a + size - 1]` is free and ends at or below `max_addr`
    pub fn find_free_bottomup(
        &self,
        size: u64,
        align: u64,
        min_addr: u64,
        max_addr: u64,
    ) -> Option<u64> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        if !window_fits(size, min_addr, max_addr) {
            return None;
        }

        if let Some(root) = self.root {
            let mut node = root;
            let mut walk = Walk::Descend;
            loop {
                match walk {
                    Walk::Descend => {
                        let n = self.node(node);
                        if n.biggest_gap < size {
                            walk = Walk::Ascend;
                        } else {
                            match n.child[LEFT] {
                                // Gaps left of a node starting at or below
                                // min_addr all end below it.
                                Some(l) if n.first > min_addr => node = l,
                                _ => walk = Walk::Visit,
                            }
                        }
                    }
                    Walk::Visit => {
                        let gap_start = self.prev_end(node).max(min_addr);
                        let gap_end = clamp_end(self.node(node).first, max_addr);
                        if let Some(start) = align_up(gap_start, align) {
                            if gap_end > start {
                                if gap_end - start >= size {
                                    return Some(start);
                                }
                                if gap_end >= max_addr {
                                    return None;
                                }
                            }
                        }
                        walk = Walk::Next;
                    }
                    Walk::Next => match self.node(node).child[RIGHT] {
                        Some(r) => {
                            node = r;
                            walk = Walk::Descend;
                        }
                        None => walk = Walk::Ascend,
                    },
                    Walk::Ascend => {
                        let Some(parent) = self.node(node).parent else {
                            break;
                        };
                        let from_left = self.node(parent).child[LEFT] == Some(node);
                        node = parent;
                        if from_left {
                            walk = Walk::Visit;
                        }
                    }
                }
            }
        }

        // Nothing inside the tree; try the space after the highest node.
        let tail_start = match self.tail {
            Some(t) => self.node(t).last.checked_add(1)?,
            None => 0,
        };
        let start = align_up(tail_start.max(min_addr), align)?;
        let end = start.checked_add(size - 1)?;
        (end <= max_addr).then_some(start)
    }

    /// Highest `align`-aligned address `a >= min_addr` such that
    /// `[a, a + size - 1]` is free and ends at or below `max_addr`
    pub fn find_free_topdown(
        &self,
        size: u64,
        align: u64,
        min_addr: u64,
        max_addr: u64,
    ) -> Option<u64> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        if !window_fits(size, min_addr, max_addr) {
            return None;
        }

        // The space after the highest node comes first.
        let tail_start = match self.tail {
            Some(t) => self.node(t).last.checked_add(1),
            None => Some(0),
        };
        if let Some(tail_start) = tail_start {
            let fits = align_up(tail_start.max(min_addr), align)
                .and_then(|start| start.checked_add(size - 1))
                .is_some_and(|end| end <= max_addr);
            if fits {
                return Some(align_down(max_addr - (size - 1), align));
            }
        }

        let mut node = self.root?;
        let mut walk = Walk::Descend;
        loop {
            match walk {
                Walk::Descend => {
                    let n = self.node(node);
                    if n.biggest_gap < size {
                        walk = Walk::Ascend;
                    } else {
                        match n.child[RIGHT] {
                            Some(r) if n.last < max_addr => node = r,
                            _ => walk = Walk::Visit,
                        }
                    }
                }
                Walk::Visit => {
                    let gap_start = self.prev_end(node).max(min_addr);
                    let gap_end = clamp_end(self.node(node).first, max_addr);
                    if let Some(start) = align_up(gap_start, align) {
                        if gap_end > start {
                            if gap_end - start >= size {
                                return Some(align_down(gap_end - size, align));
                            }
                            if gap_start <= min_addr {
                                return None;
                            }
                        }
                    }
                    walk = Walk::Next;
                }
                Walk::Next => match self.node(node).child[LEFT] {
                    Some(l) => {
                        node = l;
                        walk = Walk::Descend;
                    }
                    None => walk = Walk::Ascend,
                },
                Walk::Ascend => {
                    let parent = self.node(node).parent?;
                    let from_right = self.node(parent).child[RIGHT] == Some(node);
                    node = parent;
                    if from_right {
                        walk = Walk::Visit;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Walk the whole tree and check every structural invariant
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut order = Vec::with_capacity(self.len);
        if let Some(root) = self.root {
            self.check_subtree(root, None, &mut order)?;
        }
        if order.len() != self.len {
            return Err(InvariantViolation::Count {
                expected: self.len,
                found: order.len(),
            });
        }

        let mut prev: Option<u32> = None;
        let mut listed = self.head;
        for &i in &order {
            if listed != Some(i) || self.node(i).prev != prev {
                return Err(InvariantViolation::List);
            }
            let n = self.node(i);
            if n.first > n.last {
                return Err(InvariantViolation::Order(i));
            }
            let expected_gap = match prev {
                Some(p) => {
                    let p = self.node(p);
                    if p.last >= n.first {
                        return Err(InvariantViolation::Order(i));
                    }
                    n.first - p.last - 1
                }
                None => n.first,
            };
            if n.prev_gap != expected_gap {
                return Err(InvariantViolation::PrevGap(i));
            }
            prev = Some(i);
            listed = n.next;
        }
        if listed.is_some() || self.tail != prev {
            return Err(InvariantViolation::List);
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        i: u32,
        parent: Option<u32>,
        order: &mut Vec<u32>,
    ) -> Result<(i32, u64), InvariantViolation> {
        let n = self.node(i);
        if n.parent != parent {
            return Err(InvariantViolation::ParentLink(i));
        }
        let (hl, gl) = match n.child[LEFT] {
            Some(l) => self.check_subtree(l, Some(i), order)?,
            None => (0, 0),
        };
        order.push(i);
        let (hr, gr) = match n.child[RIGHT] {
            Some(r) => self.check_subtree(r, Some(i), order)?,
            None => (0, 0),
        };
        if (hr - hl).abs() > 1 {
            return Err(InvariantViolation::Unbalanced(i));
        }
        if n.height != 1 + max(hl, hr) {
            return Err(InvariantViolation::Height(i));
        }
        if n.biggest_gap != max(n.prev_gap, max(gl, gr)) {
            return Err(InvariantViolation::BiggestGap(i));
        }
        Ok((n.height, n.biggest_gap))
    }
}

/// Ascending iterator over a `VmaTree`
pub struct Iter<'a, T> {
    tree: &'a VmaTree<T>,
    cur: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = VmaEntry<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.cur?;
        let n = self.tree.node(i);
        self.cur = n.next;
        Some(VmaEntry {
            id: VmaId(i),
            first: n.first,
            last: n.last,
            value: &n.value,
        })
    }
}

// ============================================================================
// Address arithmetic
// ============================================================================

/// Whether `[min_addr, max_addr]` can hold `size` bytes at all
fn window_fits(size: u64, min_addr: u64, max_addr: u64) -> bool {
    size != 0 && max_addr >= min_addr && max_addr - min_addr >= size - 1
}

/// Exclusive end of the gap below a node starting at `first`, clamped so
/// that nothing past `max_addr` is used
fn clamp_end(first: u64, max_addr: u64) -> u64 {
    if max_addr == VMA_TREE_MAX {
        first
    } else {
        first.min(max_addr + 1)
    }
}

pub(crate) fn align_up(x: u64, align: u64) -> Option<u64> {
    x.checked_add(align - 1).map(|v| v & !(align - 1))
}

pub(crate) fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_of(ranges: &[(u64, u64)]) -> VmaTree<usize> {
        let mut tree = VmaTree::new();
        for (i, &(first, last)) in ranges.iter().enumerate() {
            tree.insert(first, last, i);
            tree.check_invariants().unwrap();
        }
        tree
    }

    fn ranges(tree: &VmaTree<usize>) -> Vec<(u64, u64)> {
        tree.iter().map(|e| (e.first, e.last)).collect()
    }

    #[test]
    fn test_bottomup_scenario() {
        let tree = tree_of(&[(100, 199), (300, 399)]);
        assert_eq!(tree.find_free_bottomup(50, 1, 0, 1000), Some(0));
        // Both inner gaps are only 100 wide.
        assert_eq!(tree.find_free_bottomup(150, 1, 0, 1000), Some(400));
        assert_eq!(tree.find_free_bottomup(100, 1, 0, 1000), Some(0));
        assert_eq!(tree.find_free_bottomup(100, 1, 50, 1000), Some(200));
        assert_eq!(tree.find_free_bottomup(16, 256, 1, 1000), Some(256));
        assert_eq!(tree.find_free_bottomup(700, 1, 0, 1000), None);
        assert_eq!(tree.find_free_bottomup(601, 1, 0, 1000), Some(400));
    }

    #[test]
    fn test_topdown_scenario() {
        let tree = tree_of(&[(100, 199), (300, 399)]);
        assert_eq!(tree.find_free_topdown(50, 1, 0, 1000), Some(951));
        assert_eq!(tree.find_free_topdown(50, 1, 0, 450), Some(401));
        assert_eq!(tree.find_free_topdown(100, 1, 0, 399), Some(200));
        assert_eq!(tree.find_free_topdown(100, 1, 0, 299), Some(200));
        assert_eq!(tree.find_free_topdown(100, 1, 0, 250), Some(0));
        assert_eq!(tree.find_free_topdown(101, 1, 0, 399), None);
        assert_eq!(tree.find_free_topdown(64, 64, 0, 1000), Some(896));
    }

    #[test]
    fn test_degenerate_requests() {
        let tree = tree_of(&[(100, 199)]);
        assert_eq!(tree.find_free_bottomup(0, 1, 0, 1000), None);
        assert_eq!(tree.find_free_topdown(0, 1, 0, 1000), None);
        assert_eq!(tree.find_free_bottomup(10, 1, 500, 400), None);
        assert_eq!(tree.find_free_bottomup(10, 1, 0, 8), None);
        assert_eq!(tree.find_free_bottomup(10, 1, 0, 9), Some(0));
        assert_eq!(tree.find_free_topdown(10, 1, 0, 9), Some(0));
    }

    #[test]
    fn test_address_space_top() {
        let empty: VmaTree<()> = VmaTree::new();
        assert_eq!(empty.find_free_bottomup(4096, 4096, 0, VMA_TREE_MAX), Some(0));
        assert_eq!(
            empty.find_free_topdown(4096, 4096, 0, VMA_TREE_MAX),
            Some(0xFFFF_FFFF_FFFF_F000)
        );

        let tree = tree_of(&[(VMA_TREE_MAX - 99, VMA_TREE_MAX)]);
        assert_eq!(tree.find_free_bottomup(10, 1, 0, VMA_TREE_MAX), Some(0));
        assert_eq!(
            tree.find_free_bottomup(10, 1, VMA_TREE_MAX - 200, VMA_TREE_MAX),
            Some(VMA_TREE_MAX - 200)
        );
        assert_eq!(
            tree.find_free_topdown(10, 1, 0, VMA_TREE_MAX),
            Some(VMA_TREE_MAX - 109)
        );
        assert_eq!(
            tree.find_free_bottomup(10, 1, VMA_TREE_MAX - 99, VMA_TREE_MAX),
            None
        );
    }

    #[test]
    fn test_find_queries() {
        let tree = tree_of(&[(100, 199), (300, 399), (500, 599)]);
        let at = |addr| tree.find(addr).map(|id| tree.range(id));
        assert_eq!(at(100), Some((100, 199)));
        assert_eq!(at(399), Some((300, 399)));
        assert_eq!(at(250), None);

        let above = |addr| tree.find_above(addr).map(|id| tree.range(id));
        assert_eq!(above(0), Some((100, 199)));
        assert_eq!(above(150), Some((100, 199)));
        assert_eq!(above(200), Some((300, 399)));
        assert_eq!(above(600), None);

        let below = |addr| tree.find_below(addr).map(|id| tree.range(id));
        assert_eq!(below(100), None);
        assert_eq!(below(101), Some((100, 199)));
        assert_eq!(below(450), Some((300, 399)));
        assert_eq!(below(u64::MAX), Some((500, 599)));
    }

    #[test]
    fn test_remove_all_shapes() {
        let order = [5u64, 2, 8, 1, 3, 7, 9, 0, 4, 6];
        let mut tree = VmaTree::new();
        let mut ids = Vec::new();
        for &i in &order {
            ids.push((i, tree.insert(i * 100, i * 100 + 49, i as usize)));
        }
        tree.check_invariants().unwrap();
        assert_eq!(tree.len(), 10);

        // Root first (two children), then a leaf, then the rest.
        for &pick in &[5u64, 0, 2, 8, 9, 1, 3, 4, 6, 7] {
            let pos = ids.iter().position(|&(i, _)| i == pick).unwrap();
            let (_, id) = ids.remove(pos);
            assert_eq!(tree.remove(id), pick as usize);
            tree.check_invariants().unwrap();
            assert!(tree.find(pick * 100).is_none());
        }
        assert!(tree.is_empty());
        assert!(tree.first().is_none());
        assert!(tree.last().is_none());
    }

    #[test]
    fn test_handles_survive_rebalancing() {
        let mut tree = VmaTree::new();
        let ids: Vec<VmaId> = (0..64u64).map(|i| tree.insert(i * 10, i * 10 + 4, i)).collect();
        tree.check_invariants().unwrap();
        for (i, &id) in ids.iter().enumerate() {
            assert_eq!(*tree.get(id), i as u64);
            assert_eq!(tree.range(id), (i as u64 * 10, i as u64 * 10 + 4));
        }
        for &id in ids.iter().step_by(2) {
            tree.remove(id);
        }
        tree.check_invariants().unwrap();
        for (i, &id) in ids.iter().enumerate().skip(1).step_by(2) {
            assert_eq!(*tree.get(id), i as u64);
        }
    }

    #[test]
    fn test_adjust_updates_gaps() {
        let mut tree = tree_of(&[(100, 199), (300, 399), (500, 599)]);
        let mid = tree.find(300).unwrap();

        // Shrink the middle node from both ends.
        tree.adjust(mid, 350, 359);
        tree.check_invariants().unwrap();
        assert_eq!(tree.find_free_bottomup(150, 1, 0, 1000), Some(200));
        assert_eq!(tree.find_free_topdown(140, 1, 0, 499), Some(360));

        // Grow it back out to touch both neighbours.
        tree.adjust(mid, 200, 499);
        tree.check_invariants().unwrap();
        assert_eq!(tree.find_free_bottomup(150, 1, 0, 1000), Some(600));
        assert_eq!(ranges(&tree), [(100, 199), (200, 499), (500, 599)]);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_insert_panics() {
        let mut tree = tree_of(&[(100, 199)]);
        tree.insert(150, 250, 9);
    }

    #[test]
    #[should_panic(expected = "overlaps its successor")]
    fn test_adjust_past_neighbour_panics() {
        let mut tree = tree_of(&[(100, 199), (300, 399)]);
        let first = tree.find(100).unwrap();
        tree.adjust(first, 100, 300);
    }

    #[test]
    fn test_list_navigation() {
        let tree = tree_of(&[(300, 399), (100, 199), (500, 599)]);
        let first = tree.first().unwrap();
        assert_eq!(tree.range(first), (100, 199));
        let second = tree.next(first).unwrap();
        assert_eq!(tree.range(second), (300, 399));
        assert_eq!(tree.prev(second), Some(first));
        let last = tree.last().unwrap();
        assert_eq!(tree.next(last), None);
        assert_eq!(*tree.get(last), 2);
    }
}
