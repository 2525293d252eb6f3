//! Schedulable entities and the arena that owns them.
//!
//! An entity is either a leaf queue (owns I/O, reference-counted) or a group
//! (owns a scheduling node, not refcounted). Both share the same header:
//! timestamps, weight, budget, and the intrusive tree links that let an
//! entity sit on exactly one service tree at a time. Entities live in an
//! arena and are referenced everywhere by stable [`EntityId`] index, so
//! parent back-edges never dangle.

use crate::vtime::{Timestamp, service_delta};

/// Stable handle to an entity in the scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub(crate) u32);

impl EntityId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable handle to a group's scheduling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which service-tree set an entity currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreePos {
    #[default]
    None,
    Active,
    Idle,
}

/// Intrusive ordered-tree links embedded in every entity.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RbLinks {
    pub(crate) parent: Option<EntityId>,
    pub(crate) left: Option<EntityId>,
    pub(crate) right: Option<EntityId>,
    pub(crate) red: bool,
}

/// Leaf-queue state. Queues are reference-counted: one reference for the
/// creating caller, one while the entity sits on a service tree.
#[derive(Debug, Clone)]
pub(crate) struct QueueState {
    pub(crate) refcount: u32,
    /// Weight-raising coefficient; 1 means not raised. The raising policy
    /// lives outside the engine, which only folds the coefficient into the
    /// effective weight.
    pub(crate) wr_coeff: u64,
    pub(crate) busy: bool,
}

/// Payload distinguishing leaf queues from groups.
#[derive(Debug, Clone)]
pub(crate) enum EntityKind {
    Queue(QueueState),
    Group(NodeId),
}

/// A schedulable unit: a leaf queue or a group.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Effective weight: `orig_weight` scaled by the weight-raising
    /// coefficient for queues.
    pub(crate) weight: u64,
    /// Base weight before weight-raising.
    pub(crate) orig_weight: u64,
    /// Pending weight, applied lazily when `prio_changed` is consumed.
    pub(crate) new_weight: u64,
    pub(crate) prio_changed: bool,

    /// Priority class index on the owning node (lower = higher priority).
    pub(crate) class: usize,
    /// Pending class, applied together with pending weight.
    pub(crate) new_class: usize,

    pub(crate) start: Timestamp,
    pub(crate) finish: Timestamp,
    /// Minimum `start` over the subtree rooted here, maintained on the
    /// active tree only.
    pub(crate) min_start: Timestamp,

    /// Service the entity may receive in the current slot.
    pub(crate) budget: u64,
    /// Service received in the current slot.
    pub(crate) service: u64,

    /// Whether the entity is attached to some service tree (including the
    /// window where it is in service and off both trees).
    pub(crate) on_st: bool,
    pub(crate) tree: TreePos,

    /// Weight bucket this entity is counted under in the weight counters,
    /// if any.
    pub(crate) counted_weight: Option<u64>,

    /// Entity of the enclosing group; `None` for entities directly under
    /// the root node.
    pub(crate) parent: Option<EntityId>,
    /// Scheduling node of the enclosing group.
    pub(crate) sched: NodeId,

    pub(crate) kind: EntityKind,
    pub(crate) rb: RbLinks,
}

impl Entity {
    pub(crate) fn new(
        kind: EntityKind,
        weight: u64,
        class: usize,
        parent: Option<EntityId>,
        sched: NodeId,
        budget: u64,
    ) -> Self {
        Entity {
            weight,
            orig_weight: weight,
            new_weight: weight,
            prio_changed: false,
            class,
            new_class: class,
            start: 0,
            finish: 0,
            min_start: 0,
            budget,
            service: 0,
            on_st: false,
            tree: TreePos::None,
            counted_weight: None,
            parent,
            sched,
            kind,
            rb: RbLinks::default(),
        }
    }

    /// Assign the finish time implied by charging `service` at the
    /// entity's current weight.
    pub(crate) fn calc_finish(&mut self, service: u64) {
        debug_assert!(self.weight != 0, "calc_finish with zero weight");
        self.finish = self.start.wrapping_add(service_delta(service, self.weight));
    }

    #[inline]
    pub fn is_queue(&self) -> bool {
        matches!(self.kind, EntityKind::Queue(_))
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        matches!(self.kind, EntityKind::Group(_))
    }

    #[inline]
    pub(crate) fn queue(&self) -> Option<&QueueState> {
        match &self.kind {
            EntityKind::Queue(q) => Some(q),
            EntityKind::Group(_) => None,
        }
    }

    #[inline]
    pub(crate) fn queue_mut(&mut self) -> Option<&mut QueueState> {
        match &mut self.kind {
            EntityKind::Queue(q) => Some(q),
            EntityKind::Group(_) => None,
        }
    }

    #[inline]
    pub(crate) fn group_node(&self) -> Option<NodeId> {
        match self.kind {
            EntityKind::Group(n) => Some(n),
            EntityKind::Queue(_) => None,
        }
    }

    #[inline]
    pub fn weight(&self) -> u64 {
        self.weight
    }

    #[inline]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[inline]
    pub fn finish(&self) -> Timestamp {
        self.finish
    }

    #[inline]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    #[inline]
    pub fn service(&self) -> u64 {
        self.service
    }

    #[inline]
    pub fn priority_class(&self) -> usize {
        self.class
    }

    /// Whether the entity is attached to a service tree (active, idle, or
    /// currently in service).
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.on_st
    }

    #[inline]
    pub fn on_idle_tree(&self) -> bool {
        self.tree == TreePos::Idle
    }

    #[inline]
    pub fn on_active_tree(&self) -> bool {
        self.tree == TreePos::Active
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.queue().is_some_and(|q| q.busy)
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Arena owning every entity of one scheduler instance. Slots are reused
/// once an entity is fully released.
#[derive(Debug, Default)]
pub struct EntityPool {
    slots: Vec<Option<Entity>>,
    free: Vec<u32>,
}

impl EntityPool {
    pub(crate) fn new() -> Self {
        EntityPool::default()
    }

    pub(crate) fn alloc(&mut self, entity: Entity) -> EntityId {
        match self.free.pop() {
            Some(i) => {
                debug_assert!(self.slots[i as usize].is_none());
                self.slots[i as usize] = Some(entity);
                EntityId(i)
            }
            None => {
                self.slots.push(Some(entity));
                EntityId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn free(&mut self, id: EntityId) {
        debug_assert!(self.slots[id.index()].is_some());
        self.slots[id.index()] = None;
        self.free.push(id.0);
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Take a reference on a queue entity. Groups are not refcounted.
    pub(crate) fn get_queue_ref(&mut self, id: EntityId) {
        if let Some(q) = self[id].queue_mut() {
            q.refcount += 1;
        }
    }

    /// Drop a reference on a queue entity, reclaiming its slot when the
    /// count reaches zero. Groups are not refcounted and are unaffected.
    pub(crate) fn put_queue(&mut self, id: EntityId) {
        let Some(q) = self[id].queue_mut() else {
            return;
        };
        debug_assert!(q.refcount > 0);
        q.refcount -= 1;
        if q.refcount == 0 {
            self.free(id);
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (EntityId(i as u32), e)))
    }
}

impl std::ops::Index<EntityId> for EntityPool {
    type Output = Entity;

    fn index(&self, id: EntityId) -> &Entity {
        self.slots[id.index()].as_ref().expect("stale entity id")
    }
}

impl std::ops::IndexMut<EntityId> for EntityPool {
    fn index_mut(&mut self, id: EntityId) -> &mut Entity {
        self.slots[id.index()].as_mut().expect("stale entity id")
    }
}
