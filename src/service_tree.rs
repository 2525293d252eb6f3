//! Per-class service trees.
//!
//! Each scheduling node keeps one `ServiceTree` per priority class. The
//! active tree holds backlogged entities ordered by finish time; the idle
//! tree parks recently drained entities so a re-activated entity can resume
//! its old timestamps instead of being treated as brand new. `vtime` is the
//! tree's virtual clock and `wsum` the weight of everything attached to
//! either tree (idle entities keep their weight counted so their preserved
//! credit stays meaningful).

use crate::entity::{EntityId, EntityPool, TreePos};
use crate::rbtree::{self, RbRoot};
use crate::vtime::{Timestamp, ts_gt};

#[derive(Debug, Default)]
pub struct ServiceTree {
    pub(crate) active: RbRoot,
    pub(crate) idle: RbRoot,
    /// Idle entity with the smallest finish time.
    pub(crate) first_idle: Option<EntityId>,
    /// Idle entity with the largest finish time.
    pub(crate) last_idle: Option<EntityId>,
    pub(crate) vtime: Timestamp,
    pub(crate) wsum: u64,
}

impl ServiceTree {
    pub(crate) fn new() -> Self {
        ServiceTree::default()
    }

    #[inline]
    pub fn vtime(&self) -> Timestamp {
        self.vtime
    }

    #[inline]
    pub fn wsum(&self) -> u64 {
        self.wsum
    }

    #[inline]
    pub fn has_backlog(&self) -> bool {
        !self.active.is_empty()
    }

    // -----------------------------------------------------------------------
    // Active tree
    // -----------------------------------------------------------------------

    /// Insert into the active tree and repair the `min_start` augmentation
    /// from the deepest node the insertion may have touched.
    pub(crate) fn active_insert(&mut self, pool: &mut EntityPool, id: EntityId) {
        debug_assert_eq!(pool[id].tree, TreePos::None, "entity already on a tree");
        rbtree::insert(pool, &mut self.active, id);
        pool[id].tree = TreePos::Active;

        let mut node = id;
        if let Some(l) = pool[node].rb.left {
            node = l;
        } else if let Some(r) = pool[node].rb.right {
            node = r;
        }
        rbtree::update_active_tree(pool, node);
    }

    /// Remove from the active tree, repairing `min_start` upward from the
    /// deepest node the removal can have modified.
    pub(crate) fn active_extract(&mut self, pool: &mut EntityPool, id: EntityId) {
        debug_assert_eq!(pool[id].tree, TreePos::Active);
        let deepest = rbtree::find_deepest(pool, id);
        rbtree::erase(pool, &mut self.active, id);
        pool[id].tree = TreePos::None;
        if let Some(d) = deepest {
            rbtree::update_active_tree(pool, d);
        }
    }

    // -----------------------------------------------------------------------
    // Idle tree
    // -----------------------------------------------------------------------

    pub(crate) fn idle_insert(&mut self, pool: &mut EntityPool, id: EntityId) {
        debug_assert_eq!(pool[id].tree, TreePos::None, "entity already on a tree");
        let finish = pool[id].finish;
        if self.first_idle.map_or(true, |f| ts_gt(pool[f].finish, finish)) {
            self.first_idle = Some(id);
        }
        if self.last_idle.map_or(true, |l| ts_gt(finish, pool[l].finish)) {
            self.last_idle = Some(id);
        }
        rbtree::insert(pool, &mut self.idle, id);
        pool[id].tree = TreePos::Idle;
    }

    pub(crate) fn idle_extract(&mut self, pool: &mut EntityPool, id: EntityId) {
        debug_assert_eq!(pool[id].tree, TreePos::Idle);
        if self.first_idle == Some(id) {
            self.first_idle = rbtree::next(pool, id);
        }
        if self.last_idle == Some(id) {
            self.last_idle = rbtree::prev(pool, id);
        }
        rbtree::erase(pool, &mut self.idle, id);
        pool[id].tree = TreePos::None;
    }

    // -----------------------------------------------------------------------
    // Detach / garbage collection
    // -----------------------------------------------------------------------

    /// Fully detach an entity that is no longer on either tree: drop its
    /// weight from `wsum` and release the tree's reference if it is a queue.
    pub(crate) fn forget_entity(&mut self, pool: &mut EntityPool, id: EntityId) {
        debug_assert!(pool[id].on_st, "forgetting a detached entity");
        debug_assert_eq!(pool[id].tree, TreePos::None);
        pool[id].on_st = false;
        debug_assert!(self.wsum >= pool[id].weight);
        self.wsum -= pool[id].weight;
        pool.put_queue(id);
    }

    /// Release an entity parked on the idle tree.
    pub(crate) fn put_idle_entity(&mut self, pool: &mut EntityPool, id: EntityId) {
        self.idle_extract(pool, id);
        self.forget_entity(pool, id);
    }

    /// Drop expired idle credit. To keep every operation logarithmic only
    /// one entry is released per call; with the active tree empty the vtime
    /// is jumped past the last idle finish so the whole idle tree expires
    /// and drains lazily over the following calls.
    pub(crate) fn forget_idle(&mut self, pool: &mut EntityPool) {
        if self.active.is_empty() {
            if let Some(last) = self.last_idle {
                if !ts_gt(pool[last].finish, self.vtime) {
                    self.vtime = pool[last].finish;
                }
            }
        }

        if let Some(first) = self.first_idle {
            if !ts_gt(pool[first].finish, self.vtime) {
                self.put_idle_entity(pool, first);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eligibility
    // -----------------------------------------------------------------------

    /// Advance `vtime` so that at least one active entity is eligible.
    /// Must only be called with a non-empty active tree.
    pub(crate) fn update_vtime(&mut self, pool: &mut EntityPool) {
        let root = self.active.root.expect("update_vtime on empty active tree");
        if ts_gt(pool[root].min_start, self.vtime) {
            self.vtime = pool[root].min_start;
            log::trace!("service tree vtime jumped to {}", self.vtime);
            self.forget_idle(pool);
        }
    }

    /// Find the eligible entity (start not past `vtime`) with the smallest
    /// finish time. Descends left whenever the left subtree holds at least
    /// one eligible entity (witnessed by its `min_start`); the right path is
    /// taken only while nothing eligible has been found yet.
    pub(crate) fn first_active(&self, pool: &EntityPool) -> Option<EntityId> {
        let mut first = None;
        let mut node = self.active.root;
        while let Some(n) = node {
            if !ts_gt(pool[n].start, self.vtime) {
                first = Some(n);
            }
            debug_assert!(!ts_gt(pool[n].min_start, self.vtime));
            if let Some(l) = pool[n].rb.left {
                if !ts_gt(pool[l].min_start, self.vtime) {
                    node = Some(l);
                    continue;
                }
            }
            if first.is_some() {
                break;
            }
            node = pool[n].rb.right;
        }
        debug_assert!(first.is_some() || self.active.is_empty());
        first
    }

    /// First eligible entity after updating the virtual time, or `None` when
    /// the class has no backlog.
    pub(crate) fn lookup_next(&mut self, pool: &mut EntityPool) -> Option<EntityId> {
        if self.active.is_empty() {
            return None;
        }
        self.update_vtime(pool);
        let entity = self.first_active(pool);
        debug_assert!(entity.is_some_and(|e| !ts_gt(pool[e].start, self.vtime)));
        entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind, NodeId, QueueState};

    fn attach(pool: &mut EntityPool, st: &mut ServiceTree, start: u64, finish: u64, weight: u64) -> EntityId {
        let mut e = Entity::new(
            EntityKind::Queue(QueueState {
                refcount: 1,
                wr_coeff: 1,
                busy: false,
            }),
            weight,
            0,
            None,
            NodeId(0),
            512,
        );
        e.start = start;
        e.finish = finish;
        e.on_st = true;
        let id = pool.alloc(e);
        pool.get_queue_ref(id);
        st.wsum += weight;
        id
    }

    #[test]
    fn first_active_prefers_smallest_finish_among_eligible() {
        let mut pool = EntityPool::new();
        let mut st = ServiceTree::new();
        st.vtime = 100;

        // eligible, finish 900
        let a = attach(&mut pool, &mut st, 50, 900, 100);
        st.active_insert(&mut pool, a);
        // not eligible, finish 200: smaller finish but must be skipped
        let b = attach(&mut pool, &mut st, 150, 200, 100);
        st.active_insert(&mut pool, b);
        // eligible, finish 400: the correct pick
        let c = attach(&mut pool, &mut st, 90, 400, 100);
        st.active_insert(&mut pool, c);

        assert_eq!(st.first_active(&pool), Some(c));
    }

    #[test]
    fn update_vtime_jumps_to_min_start() {
        let mut pool = EntityPool::new();
        let mut st = ServiceTree::new();
        let a = attach(&mut pool, &mut st, 500, 900, 100);
        st.active_insert(&mut pool, a);

        assert_eq!(st.vtime(), 0);
        let picked = st.lookup_next(&mut pool);
        assert_eq!(picked, Some(a));
        // nothing was eligible at vtime 0, so the clock skipped forward
        assert_eq!(st.vtime(), 500);
    }

    #[test]
    fn idle_caches_slide_on_extract() {
        let mut pool = EntityPool::new();
        let mut st = ServiceTree::new();
        let a = attach(&mut pool, &mut st, 0, 100, 100);
        let b = attach(&mut pool, &mut st, 0, 200, 100);
        let c = attach(&mut pool, &mut st, 0, 300, 100);
        for id in [b, a, c] {
            st.idle_insert(&mut pool, id);
        }
        assert_eq!(st.first_idle, Some(a));
        assert_eq!(st.last_idle, Some(c));

        st.idle_extract(&mut pool, a);
        assert_eq!(st.first_idle, Some(b));
        st.idle_extract(&mut pool, c);
        assert_eq!(st.last_idle, Some(b));
    }

    #[test]
    fn forget_idle_releases_one_expired_entry_per_call() {
        let mut pool = EntityPool::new();
        let mut st = ServiceTree::new();
        let a = attach(&mut pool, &mut st, 0, 100, 100);
        let b = attach(&mut pool, &mut st, 0, 200, 100);
        st.idle_insert(&mut pool, a);
        st.idle_insert(&mut pool, b);

        st.vtime = 150; // a's credit has expired, b's has not
        st.forget_idle(&mut pool);
        assert_eq!(st.first_idle, Some(b));
        assert_eq!(st.wsum(), 100);
        // b is still within credit: a second call must not touch it
        st.forget_idle(&mut pool);
        assert_eq!(st.first_idle, Some(b));
    }

    #[test]
    fn empty_active_tree_expires_whole_idle_tree_lazily() {
        let mut pool = EntityPool::new();
        let mut st = ServiceTree::new();
        let a = attach(&mut pool, &mut st, 0, 100, 100);
        let b = attach(&mut pool, &mut st, 0, 200, 100);
        st.idle_insert(&mut pool, a);
        st.idle_insert(&mut pool, b);

        st.vtime = 250; // past every idle finish, active tree empty
        st.forget_idle(&mut pool);
        // vtime jumped to the last idle finish and one entry was dropped
        assert_eq!(st.vtime(), 200);
        assert_eq!(st.first_idle, Some(b));
        st.forget_idle(&mut pool);
        assert_eq!(st.first_idle, None);
        assert_eq!(st.wsum(), 0);
    }
}
