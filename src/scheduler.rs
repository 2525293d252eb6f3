//! The B-WF2Q+ engine.
//!
//! Entities are arranged in a hierarchy of groups rooted at one scheduling
//! node per scheduler. Activating a backlogged leaf walks the chain up to
//! the root inserting each level into its service tree; deactivation walks
//! the other way. Selection descends from the root, at each node taking the
//! eligible entity with the smallest finish time from the highest non-empty
//! priority class, until it lands on a leaf queue. Each node caches its
//! `next_in_service` choice so an activation below that does not change the
//! node's ordering can stop propagating upward.
//!
//! Every operation runs under the caller's exclusive lock and is bounded and
//! synchronous; the only time dependency is the caller-supplied monotonic
//! tick passed to [`Scheduler::get_next_queue`].

use crate::entity::{Entity, EntityId, EntityKind, EntityPool, NodeId, QueueState, TreePos};
use crate::service_tree::ServiceTree;
use crate::vtime::{Timestamp, service_delta, ts_gt, ts_max};
use crate::weights::WeightCounters;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Caller-supplied knobs. Everything time-like is in the caller's tick unit;
/// service is in abstract units (e.g. sectors).
#[derive(Debug, Clone)]
pub struct SchedParams {
    /// Number of priority classes per scheduling node. The last class is
    /// the idle class, served only when higher classes are empty or when
    /// its starvation interval expires.
    pub num_classes: usize,
    /// Class that group entities are scheduled in.
    pub group_class: usize,
    pub min_weight: u64,
    pub max_weight: u64,
    /// Largest service a queue may receive in one slot.
    pub max_budget: u64,
    /// Ticks the idle class may go unserved before a pick is forced.
    pub class_idle_timeout: u64,
    /// Duration of a full service slot in milliseconds, the reference for
    /// time-based charging of slow queues.
    pub slice_timeout_ms: u64,
}

impl Default for SchedParams {
    fn default() -> Self {
        SchedParams {
            num_classes: 3,
            group_class: 1,
            min_weight: 1,
            max_weight: 1000,
            max_budget: 16 * 1024,
            class_idle_timeout: 200,
            slice_timeout_ms: 125,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling node
// ---------------------------------------------------------------------------

/// Per-group scheduling state: one service tree per priority class plus the
/// in-service / next-in-service bookkeeping.
#[derive(Debug)]
pub(crate) struct SchedNode {
    pub(crate) trees: Vec<ServiceTree>,
    pub(crate) in_service: Option<EntityId>,
    pub(crate) next_in_service: Option<EntityId>,
    /// Group entity owning this node; `None` for the root node, whose
    /// entity-less group is never itself scheduled.
    pub(crate) owner: Option<EntityId>,
    /// Entities currently on this node's active trees. Not kept for the
    /// root node.
    pub(crate) active_entities: u32,
}

impl SchedNode {
    fn new(num_classes: usize) -> Self {
        SchedNode {
            trees: (0..num_classes).map(|_| ServiceTree::new()).collect(),
            in_service: None,
            next_in_service: None,
            owner: None,
            active_entities: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Weight counter maintenance
// ---------------------------------------------------------------------------

fn weights_tree_add(map: &mut WeightCounters, pool: &mut EntityPool, e: EntityId) {
    if pool[e].counted_weight.is_some() {
        return;
    }
    let w = pool[e].weight;
    map.add(w);
    pool[e].counted_weight = Some(w);
}

fn weights_tree_remove(map: &mut WeightCounters, pool: &mut EntityPool, e: EntityId) {
    if let Some(w) = pool[e].counted_weight.take() {
        map.remove(w);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One scheduler instance per device. All state lives here; there are no
/// globals.
pub struct Scheduler {
    pool: EntityPool,
    nodes: Vec<Option<SchedNode>>,
    free_nodes: Vec<u32>,
    root: NodeId,
    in_service_queue: Option<EntityId>,
    busy_queues: u32,
    /// Busy queues currently weight-raised.
    wr_busy_queues: u32,
    /// Tick of the last forced idle-class service.
    class_idle_last_service: u64,
    queue_weights: WeightCounters,
    group_weights: WeightCounters,
    params: SchedParams,
}

impl Scheduler {
    pub fn new(params: SchedParams) -> Self {
        assert!(params.num_classes >= 1, "at least one priority class");
        assert!(params.group_class < params.num_classes);
        assert!(params.min_weight >= 1 && params.min_weight <= params.max_weight);

        let mut sched = Scheduler {
            pool: EntityPool::new(),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: NodeId(0),
            in_service_queue: None,
            busy_queues: 0,
            wr_busy_queues: 0,
            class_idle_last_service: 0,
            queue_weights: WeightCounters::new(),
            group_weights: WeightCounters::new(),
            params,
        };
        let num_classes = sched.params.num_classes;
        sched.root = sched.alloc_node(SchedNode::new(num_classes));
        sched
    }

    // -----------------------------------------------------------------------
    // Arena plumbing
    // -----------------------------------------------------------------------

    fn alloc_node(&mut self, node: SchedNode) -> NodeId {
        match self.free_nodes.pop() {
            Some(i) => {
                debug_assert!(self.nodes[i as usize].is_none());
                self.nodes[i as usize] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn free_node(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id.index()].is_some());
        self.nodes[id.index()] = None;
        self.free_nodes.push(id.0);
    }

    fn node(&self, id: NodeId) -> &SchedNode {
        self.nodes[id.index()].as_ref().expect("stale node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut SchedNode {
        self.nodes[id.index()].as_mut().expect("stale node id")
    }

    /// Split borrow: the entity arena and one node, mutably at once.
    fn pool_and_node(&mut self, id: NodeId) -> (&mut EntityPool, &mut SchedNode) {
        (
            &mut self.pool,
            self.nodes[id.index()].as_mut().expect("stale node id"),
        )
    }

    /// Node identified by a group handle; `None` means the root.
    fn node_of(&self, group: Option<EntityId>) -> NodeId {
        match group {
            None => self.root,
            Some(g) => self.pool[g].group_node().expect("entity is not a group"),
        }
    }

    /// Service tree an entity belongs to: its enclosing node, indexed by
    /// its priority class.
    fn tree_loc(&self, e: EntityId) -> (NodeId, usize) {
        (self.pool[e].sched, self.pool[e].class)
    }

    fn clamp_weight(&self, weight: u64) -> u64 {
        if weight < self.params.min_weight || weight > self.params.max_weight {
            log::warn!(
                "weight {} outside [{}, {}], clamping",
                weight,
                self.params.min_weight,
                self.params.max_weight
            );
        }
        weight.clamp(self.params.min_weight, self.params.max_weight)
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    /// Create a group under `parent` (`None` = directly under the root).
    pub fn add_group(&mut self, parent: Option<EntityId>, weight: u64) -> EntityId {
        let sched = self.node_of(parent);
        let weight = self.clamp_weight(weight);
        let num_classes = self.params.num_classes;
        let node_id = self.alloc_node(SchedNode::new(num_classes));
        let entity = Entity::new(
            EntityKind::Group(node_id),
            weight,
            self.params.group_class,
            parent,
            sched,
            self.params.max_budget,
        );
        let id = self.pool.alloc(entity);
        self.node_mut(node_id).owner = Some(id);
        id
    }

    /// Destroy a group. It must be inactive: no descendant may be attached.
    pub fn remove_group(&mut self, g: EntityId) {
        debug_assert!(self.pool[g].is_group());
        debug_assert!(!self.pool[g].is_attached(), "removing an active group");
        let Some(node_id) = self.pool[g].group_node() else {
            return;
        };
        debug_assert!(self.node(node_id).trees.iter().all(|st| st.wsum() == 0));
        self.free_node(node_id);
        self.pool.free(g);
    }

    /// Create a leaf queue under `parent` (`None` = directly under the
    /// root). The caller holds one reference until
    /// [`Scheduler::release_queue`].
    pub fn add_queue(&mut self, parent: Option<EntityId>, weight: u64, class: usize) -> EntityId {
        debug_assert!(class < self.params.num_classes);
        let sched = self.node_of(parent);
        let weight = self.clamp_weight(weight);
        let entity = Entity::new(
            EntityKind::Queue(QueueState {
                refcount: 1,
                wr_coeff: 1,
                busy: false,
            }),
            weight,
            class,
            parent,
            sched,
            self.params.max_budget,
        );
        let id = self.pool.alloc(entity);
        // run the full reweight path on first activation
        self.pool[id].prio_changed = true;
        id
    }

    /// Drop the caller's reference to a queue. The slot is reclaimed once
    /// the service trees have released theirs too.
    pub fn release_queue(&mut self, q: EntityId) {
        debug_assert!(self.pool[q].is_queue());
        debug_assert!(!self.pool[q].is_busy(), "releasing a busy queue");
        self.pool.put_queue(q);
    }

    // -----------------------------------------------------------------------
    // Active-tree wrappers (tree op + group accounting)
    // -----------------------------------------------------------------------

    fn active_insert(&mut self, e: EntityId) {
        let (nid, class) = self.tree_loc(e);
        {
            let (pool, node) = self.pool_and_node(nid);
            node.trees[class].active_insert(pool, e);
        }
        if self.pool[e].is_group() {
            weights_tree_add(&mut self.group_weights, &mut self.pool, e);
        }
        let node = self.node_mut(nid);
        if node.owner.is_some() {
            node.active_entities += 1;
        }
    }

    fn active_extract(&mut self, e: EntityId) {
        let (nid, class) = self.tree_loc(e);
        {
            let (pool, node) = self.pool_and_node(nid);
            node.trees[class].active_extract(pool, e);
        }
        if self.pool[e].is_group() {
            weights_tree_remove(&mut self.group_weights, &mut self.pool, e);
        }
        let node = self.node_mut(nid);
        if node.owner.is_some() {
            debug_assert!(node.active_entities > 0);
            node.active_entities -= 1;
        }
    }

    // -----------------------------------------------------------------------
    // Next-in-service caching
    // -----------------------------------------------------------------------

    /// Propagate the chosen entity's budget into the group entity owning
    /// its node, so the level above schedules with the right slot size. The
    /// root node has no owner: its entity-less group is the terminator and
    /// is never scheduled itself.
    fn update_budget(&mut self, next: EntityId) {
        let nid = self.pool[next].sched;
        if let Some(owner) = self.node(nid).owner {
            let budget = self.pool[next].budget;
            self.pool[owner].budget = budget;
        }
    }

    /// Refresh a node's cached selection. Returns `false` when the node has
    /// an entity in service: the cache is recomputed anyway when that
    /// entity is requeued, so callers can stop walking upward.
    fn update_next_in_service(&mut self, nid: NodeId) -> bool {
        if self.node(nid).in_service.is_some() {
            return false;
        }
        let next = self.lookup_next_entity(nid, false, None);
        self.node_mut(nid).next_in_service = next;
        if let Some(n) = next {
            self.update_budget(n);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Select across this node's priority classes: the first non-empty
    /// class's eligible entity with the smallest finish time. With
    /// `extract` the choice is pulled off its active tree and made the
    /// node's in-service entity. A tick in `now` enables the idle-class
    /// starvation check (selection path only; cache refreshes pass `None`).
    fn lookup_next_entity(
        &mut self,
        nid: NodeId,
        extract: bool,
        now: Option<u64>,
    ) -> Option<EntityId> {
        debug_assert!(self.node(nid).in_service.is_none());
        let num_classes = self.params.num_classes;
        let mut start_class = 0;

        // Serve the idle class if it has been starved past its interval.
        // Besides guaranteeing it a minimum of bandwidth, this mitigates
        // priority inversion when a low-class task holds shared resources.
        if let Some(now) = now {
            if now.wrapping_sub(self.class_idle_last_service) > self.params.class_idle_timeout {
                let idle_class = num_classes - 1;
                let forced = {
                    let (pool, node) = self.pool_and_node(nid);
                    node.trees[idle_class].lookup_next(pool)
                };
                if let Some(e) = forced {
                    log::trace!("idle class starved, forcing its next entity");
                    if self.node(nid).next_in_service != Some(e) {
                        let mut cur = Some(e);
                        while let Some(c) = cur {
                            self.update_budget(c);
                            cur = self.pool[c].parent;
                        }
                    }
                    start_class = idle_class;
                    self.class_idle_last_service = now;
                    self.node_mut(nid).next_in_service = Some(e);
                }
            }
        }

        for class in start_class..num_classes {
            let entity = {
                let (pool, node) = self.pool_and_node(nid);
                node.trees[class].lookup_next(pool)
            };
            if let Some(e) = entity {
                if extract {
                    if self.node(nid).next_in_service != Some(e) {
                        log::warn!("extracted entity differs from the cached next-in-service");
                    }
                    self.active_extract(e);
                    let node = self.node_mut(nid);
                    node.in_service = Some(e);
                    node.next_in_service = None;
                }
                return Some(e);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Weight / priority update
    // -----------------------------------------------------------------------

    /// Apply a pending weight or class change. Runs at activation time,
    /// between detaching from the old tree position and computing the new
    /// finish time.
    fn update_weight_prio(&mut self, e: EntityId) {
        if !self.pool[e].prio_changed {
            return;
        }
        let nid = self.pool[e].sched;
        let old_class = self.pool[e].class;

        {
            let (pool, node) = self.pool_and_node(nid);
            let st = &mut node.trees[old_class];
            debug_assert!(st.wsum() >= pool[e].weight);
            st.wsum -= pool[e].weight;
        }

        if self.pool[e].new_weight != self.pool[e].orig_weight {
            let requested = self.pool[e].new_weight;
            let clamped = self.clamp_weight(requested);
            self.pool[e].new_weight = clamped;
            self.pool[e].orig_weight = clamped;
        }
        if self.pool[e].is_queue() {
            let new_class = self.pool[e].new_class;
            self.pool[e].class = new_class;
        }
        self.pool[e].prio_changed = false;

        // NOTE: the weight moves to the (possibly different) service tree
        // right away, which can cause transient unfairness. Deferring the
        // change until the entity's outstanding finish falls behind the old
        // tree's vtime would need extra state to track.
        let new_class = self.pool[e].class;
        let prev_weight = self.pool[e].weight;
        let wr_coeff = self.pool[e].queue().map_or(1, |q| q.wr_coeff);
        let new_weight = self.pool[e].orig_weight * wr_coeff;
        let is_queue = self.pool[e].is_queue();

        if prev_weight != new_weight {
            log::trace!("effective weight changed {} -> {}", prev_weight, new_weight);
            let map = if is_queue {
                &mut self.queue_weights
            } else {
                &mut self.group_weights
            };
            weights_tree_remove(map, &mut self.pool, e);
        }
        self.pool[e].weight = new_weight;
        // weight-raised queues stay out of the counters
        if prev_weight != new_weight && wr_coeff == 1 {
            let map = if is_queue {
                &mut self.queue_weights
            } else {
                &mut self.group_weights
            };
            weights_tree_add(map, &mut self.pool, e);
        }

        {
            let (pool, node) = self.pool_and_node(nid);
            node.trees[new_class].wsum += new_weight;
            if new_class != old_class {
                pool[e].start = node.trees[new_class].vtime();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    /// Attach one entity to its active tree with fresh timestamps.
    fn activate_one(&mut self, e: EntityId, non_blocking_wait: bool) {
        let nid = self.pool[e].sched;
        let old_class = self.pool[e].class;
        let mut backshifted = false;

        if self.node(nid).in_service == Some(e) {
            debug_assert_eq!(self.pool[e].tree, TreePos::None);
            // Requeue of the entity in service: charge only the service it
            // actually received before stamping the new slot.
            let service = self.pool[e].service;
            let ent = &mut self.pool[e];
            ent.calc_finish(service);
            ent.start = ent.finish;
            self.node_mut(nid).in_service = None;
        } else if self.pool[e].tree == TreePos::Active {
            // Requeue due to a change at some level below; the old start
            // time is still valid.
            self.active_extract(e);
        } else {
            let vtime = self.node(nid).trees[old_class].vtime();
            let min_vstart = if non_blocking_wait && ts_gt(vtime, self.pool[e].finish) {
                backshifted = true;
                self.pool[e].finish
            } else {
                vtime
            };

            if self.pool[e].tree == TreePos::Idle {
                {
                    let (pool, node) = self.pool_and_node(nid);
                    node.trees[old_class].idle_extract(pool, e);
                }
                let finish = self.pool[e].finish;
                self.pool[e].start = ts_max(min_vstart, finish);
            } else {
                // Never attached, or fully forgotten: the old finish time
                // carries no usable credit.
                debug_assert!(!self.pool[e].on_st);
                self.pool[e].start = min_vstart;
                let weight = self.pool[e].weight;
                self.node_mut(nid).trees[old_class].wsum += weight;
                self.pool.get_queue_ref(e);
                self.pool[e].on_st = true;
            }
        }

        self.update_weight_prio(e);
        let budget = self.pool[e].budget;
        self.pool[e].calc_finish(budget);

        if backshifted {
            let class = self.pool[e].class;
            let vtime = self.node(nid).trees[class].vtime();
            if ts_gt(vtime, self.pool[e].finish) {
                // A queue that stayed idle while vtime moved on would keep
                // timestamps far in the past and monopolize the device once
                // it wakes up. Lift it just enough that its finish lands on
                // the current vtime; weight-raised queues are lifted
                // proportionally less.
                let mut delta = vtime.wrapping_sub(self.pool[e].finish);
                if let Some(q) = self.pool[e].queue() {
                    delta /= q.wr_coeff;
                }
                let ent = &mut self.pool[e];
                ent.start = ent.start.wrapping_add(delta);
                ent.finish = ent.finish.wrapping_add(delta);
            }
        }

        self.active_insert(e);

        log::trace!(
            "activated entity, {} in its service tree",
            if ts_gt(
                self.pool[e].start,
                self.node(nid).trees[self.pool[e].class].vtime()
            ) {
                "not yet eligible"
            } else {
                "eligible"
            }
        );
    }

    /// Activate an entity and every ancestor that needs it, stopping as
    /// soon as a node's cached selection is unaffected.
    fn activate_entity(&mut self, e: EntityId, non_blocking_wait: bool) {
        let mut cur = Some(e);
        while let Some(c) = cur {
            self.activate_one(c, non_blocking_wait);
            let nid = self.pool[c].sched;
            if !self.update_next_in_service(nid) {
                // this level is being served; it will be requeued with a
                // consistent view at the end of its slot
                break;
            }
            cur = self.pool[c].parent;
        }
    }

    // -----------------------------------------------------------------------
    // Deactivation
    // -----------------------------------------------------------------------

    /// Detach one entity. With `requeue` and unexpired credit it is parked
    /// on the idle tree, otherwise it is forgotten. Returns whether the
    /// node's cached selection changed, i.e. whether the hierarchy above
    /// needs updating.
    fn deactivate_one(&mut self, e: EntityId, requeue: bool) -> bool {
        if !self.pool[e].on_st {
            // never activated, or already detached
            return false;
        }
        let nid = self.pool[e].sched;
        let class = self.pool[e].class;
        let in_service = self.node(nid).in_service == Some(e);
        debug_assert!(!(in_service && self.pool[e].tree != TreePos::None));

        if in_service {
            // finalize with the service actually consumed, not the budget
            let service = self.pool[e].service;
            self.pool[e].calc_finish(service);
            self.node_mut(nid).in_service = None;
        } else if self.pool[e].tree == TreePos::Active {
            self.active_extract(e);
        } else if self.pool[e].tree == TreePos::Idle {
            let (pool, node) = self.pool_and_node(nid);
            node.trees[class].idle_extract(pool, e);
        }

        let mut changed = false;
        if in_service || self.node(nid).next_in_service == Some(e) {
            changed = self.update_next_in_service(nid);
        }

        let expired = !ts_gt(self.pool[e].finish, self.node(nid).trees[class].vtime());
        {
            let (pool, node) = self.pool_and_node(nid);
            let st = &mut node.trees[class];
            if !requeue || expired {
                st.forget_entity(pool, e);
            } else {
                st.idle_insert(pool, e);
            }
        }

        debug_assert!(self.node(nid).in_service != Some(e));
        debug_assert!(self.node(nid).next_in_service != Some(e));
        changed
    }

    /// Deactivate an entity and propagate along the chain: ancestors whose
    /// group emptied are deactivated in turn; once an ancestor is still
    /// backlogged the remaining levels are requeued instead so their
    /// timestamps reflect the new shape below.
    fn deactivate_entity(&mut self, e: EntityId, requeue: bool) {
        let mut requeue = requeue;
        let mut cur = Some(e);
        while let Some(c) = cur {
            // the entity may be forgotten (slot reclaimed) inside
            // deactivate_one, so capture the parent first
            let parent = self.pool[c].parent;
            let nid = self.pool[c].sched;

            if !self.deactivate_one(c, requeue) {
                // the cached selection survived; nothing above changes
                return;
            }

            if self.node(nid).next_in_service.is_some() {
                // the group is still backlogged: switch to the update path
                let mut up = parent;
                while let Some(u) = up {
                    self.activate_one(u, false);
                    let unid = self.pool[u].sched;
                    if !self.update_next_in_service(unid) {
                        break;
                    }
                    up = self.pool[u].parent;
                }
                return;
            }

            // the group emptied: deactivate upward, preserving its credit
            requeue = true;
            cur = parent;
        }
    }

    // -----------------------------------------------------------------------
    // Charging
    // -----------------------------------------------------------------------

    /// Credit `amount` of service to the queue and every ancestor,
    /// advancing each level's virtual time by the weight-sum-scaled delta.
    /// One expired idle entry per tree is garbage-collected on the way.
    pub fn served(&mut self, q: EntityId, amount: u64) {
        debug_assert!(self.pool[q].is_queue());
        let mut cur = Some(q);
        while let Some(c) = cur {
            self.pool[c].service += amount;
            let (nid, class) = self.tree_loc(c);
            let (pool, node) = self.pool_and_node(nid);
            let st = &mut node.trees[class];
            debug_assert!(st.wsum() != 0);
            st.vtime = st.vtime.wrapping_add(service_delta(amount, st.wsum()));
            st.forget_idle(pool);
            cur = self.pool[c].parent;
        }
        log::trace!("charged {} service units", amount);
    }

    /// Charge a queue for the wall-clock length of its slot instead of the
    /// service it consumed. Queues that drain their budget slowly would
    /// otherwise hoard the device under service fairness; inflating their
    /// charge to what a fast queue would have received in the same time
    /// converts their accounting to time fairness.
    pub fn charge_time(&mut self, q: EntityId, time_ms: u64) {
        debug_assert!(self.pool[q].is_queue());
        let service = self.pool[q].service;
        let timeout = self.params.slice_timeout_ms;
        let mut to_charge = service;
        if time_ms > 0 && time_ms < timeout {
            to_charge = self.params.max_budget * time_ms / timeout;
        }
        if to_charge < service {
            to_charge = service;
        }
        log::trace!(
            "time charge: {}ms of {}ms, {} -> {} units",
            time_ms,
            timeout,
            service,
            to_charge
        );

        // grow the budget so the inflated charge stays consistent
        if to_charge > self.pool[q].budget {
            self.pool[q].budget = to_charge;
        }
        self.served(q, to_charge - service);
    }

    // -----------------------------------------------------------------------
    // Busy transitions
    // -----------------------------------------------------------------------

    /// A queue with no backlog received a request: activate its chain up to
    /// the root. `non_blocking_wait` marks a queue whose slot was kept open
    /// while it briefly had nothing to issue, entitling it to resume its
    /// old timestamps (backshift).
    pub fn add_busy(&mut self, q: EntityId, non_blocking_wait: bool) {
        debug_assert!(self.pool[q].is_queue());
        debug_assert!(!self.pool[q].is_busy(), "queue is already busy");
        debug_assert!(self.in_service_queue != Some(q));
        log::debug!("queue joins the busy set");

        self.activate_entity(q, non_blocking_wait);

        if let Some(qs) = self.pool[q].queue_mut() {
            qs.busy = true;
        }
        self.busy_queues += 1;

        let wr_coeff = self.pool[q].queue().map_or(1, |s| s.wr_coeff);
        if wr_coeff == 1 {
            weights_tree_add(&mut self.queue_weights, &mut self.pool, q);
        } else {
            self.wr_busy_queues += 1;
        }
    }

    /// A queue drained its last request: deactivate its chain. With
    /// `requeue` and unexpired credit the queue is parked on its idle tree.
    /// The queue must not be the one in service; reset that first.
    pub fn del_busy(&mut self, q: EntityId, requeue: bool) {
        debug_assert!(self.pool[q].is_busy(), "queue is not busy");
        debug_assert!(
            self.in_service_queue != Some(q),
            "reset the in-service queue first"
        );
        log::debug!("queue leaves the busy set");

        if let Some(qs) = self.pool[q].queue_mut() {
            qs.busy = false;
        }
        debug_assert!(self.busy_queues > 0);
        self.busy_queues -= 1;

        weights_tree_remove(&mut self.queue_weights, &mut self.pool, q);
        if self.pool[q].queue().map_or(1, |s| s.wr_coeff) > 1 {
            debug_assert!(self.wr_busy_queues > 0);
            self.wr_busy_queues -= 1;
        }

        self.deactivate_entity(q, requeue);
    }

    /// Put a still-busy queue back on its service tree after its slot
    /// ended, finalizing its timestamps from the service it consumed.
    pub fn requeue(&mut self, q: EntityId) {
        debug_assert!(self.pool[q].is_busy());
        self.activate_entity(q, false);
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Descend from the root picking the next entity at each level until a
    /// leaf queue is reached, marking the whole chain in service. Returns
    /// `None` when no queue is busy. `now` is the caller's monotonic tick,
    /// used only for the idle-class starvation check.
    pub fn get_next_queue(&mut self, now: u64) -> Option<EntityId> {
        debug_assert!(self.in_service_queue.is_none());
        if self.busy_queues == 0 {
            return None;
        }

        let mut nid = self.root;
        loop {
            let Some(e) = self.lookup_next_entity(nid, true, Some(now)) else {
                debug_assert!(false, "busy queues but nothing schedulable");
                return None;
            };
            // a fresh slot starts at every level entered
            self.pool[e].service = 0;
            match self.pool[e].group_node() {
                Some(child) => nid = child,
                None => {
                    log::trace!("queue selected for service");
                    self.in_service_queue = Some(e);
                    return Some(e);
                }
            }
        }
    }

    /// Clear the in-service queue after its slot expires or it is
    /// preempted. The caller requeues or deactivates the queue separately.
    pub fn reset_in_service(&mut self) {
        self.in_service_queue = None;
    }

    /// Whether the root's cached choice differs from what is being served,
    /// a hint that a newly arrived entity deserves preemption.
    pub fn next_may_preempt(&self) -> bool {
        let root = self.node(self.root);
        root.next_in_service != root.in_service
    }

    // -----------------------------------------------------------------------
    // Pending weight / priority changes
    // -----------------------------------------------------------------------

    /// Record a new base weight, applied lazily at the next activation.
    pub fn update_weight(&mut self, e: EntityId, new_weight: u64) {
        self.pool[e].new_weight = new_weight;
        self.pool[e].prio_changed = true;
    }

    /// Record a new priority class for a queue, applied lazily with the
    /// same mechanism as weight changes.
    pub fn set_class(&mut self, q: EntityId, class: usize) {
        debug_assert!(self.pool[q].is_queue());
        debug_assert!(class < self.params.num_classes);
        self.pool[q].new_class = class;
        self.pool[q].prio_changed = true;
    }

    /// Record a new weight-raising coefficient for a queue. The raising
    /// policy itself lives outside the engine.
    pub fn set_wr_coeff(&mut self, q: EntityId, coeff: u64) {
        debug_assert!(self.pool[q].is_queue());
        debug_assert!(coeff >= 1);
        if let Some(qs) = self.pool[q].queue_mut() {
            qs.wr_coeff = coeff;
        }
        self.pool[q].prio_changed = true;
    }

    /// Set the service a queue may consume in its next slot.
    pub fn set_budget(&mut self, q: EntityId, budget: u64) {
        debug_assert!(self.pool[q].is_queue());
        debug_assert!(budget <= self.params.max_budget);
        self.pool[q].budget = budget;
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.pool[id]
    }

    pub fn busy_queues(&self) -> u32 {
        self.busy_queues
    }

    pub fn wr_busy_queues(&self) -> u32 {
        self.wr_busy_queues
    }

    pub fn in_service_queue(&self) -> Option<EntityId> {
        self.in_service_queue
    }

    /// Service tree of a group (`None` = root node) and priority class.
    pub fn service_tree(&self, group: Option<EntityId>, class: usize) -> &ServiceTree {
        &self.node(self.node_of(group)).trees[class]
    }

    pub fn next_in_service(&self, group: Option<EntityId>) -> Option<EntityId> {
        self.node(self.node_of(group)).next_in_service
    }

    pub fn in_service_entity(&self, group: Option<EntityId>) -> Option<EntityId> {
        self.node(self.node_of(group)).in_service
    }

    /// Tick of the last forced idle-class pick.
    pub fn class_idle_last_service(&self) -> u64 {
        self.class_idle_last_service
    }

    pub fn queue_weights(&self) -> &WeightCounters {
        &self.queue_weights
    }

    pub fn group_weights(&self) -> &WeightCounters {
        &self.group_weights
    }

    pub fn params(&self) -> &SchedParams {
        &self.params
    }

    // -----------------------------------------------------------------------
    // Consistency checking (test support)
    // -----------------------------------------------------------------------

    /// Deep consistency walk over every node and tree. Panics on the first
    /// violation. Meant for tests and debugging; linear in the number of
    /// entities.
    #[doc(hidden)]
    pub fn validate(&self) {
        for (idx, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            for (class, st) in node.trees.iter().enumerate() {
                let expected: u64 = self
                    .pool
                    .iter()
                    .filter(|(_, e)| e.on_st && e.sched.index() == idx && e.class == class)
                    .map(|(_, e)| e.weight)
                    .sum();
                assert_eq!(st.wsum(), expected, "wsum out of sync with attached weights");
                if let Some(root) = st.active.root {
                    Self::validate_active(&self.pool, root, None);
                }
                assert_eq!(
                    st.first_idle,
                    crate::rbtree::first(&self.pool, &st.idle),
                    "stale first_idle cache"
                );
            }
            if let Some(ins) = node.in_service {
                assert_eq!(
                    self.pool[ins].tree,
                    TreePos::None,
                    "in-service entity still on a tree"
                );
                assert!(self.pool[ins].on_st);
            }
        }

        for (_, e) in self.pool.iter() {
            if e.tree != TreePos::None {
                assert!(e.on_st, "tree membership without attachment");
            }
            // a busy leaf keeps its whole ancestor chain active
            if e.is_busy() {
                let mut cur = e.parent;
                while let Some(c) = cur {
                    let anc = &self.pool[c];
                    assert!(anc.on_st, "busy leaf below a detached ancestor");
                    assert!(
                        anc.tree == TreePos::Active || self.node(anc.sched).in_service == Some(c),
                        "busy leaf below an inactive ancestor"
                    );
                    cur = anc.parent;
                }
            }
        }
    }

    fn validate_active(pool: &EntityPool, n: EntityId, parent: Option<EntityId>) -> Timestamp {
        assert_eq!(pool[n].rb.parent, parent, "broken parent link");
        assert_eq!(pool[n].tree, TreePos::Active);
        let mut min = pool[n].start;
        if let Some(l) = pool[n].rb.left {
            assert!(
                !ts_gt(pool[l].finish, pool[n].finish),
                "active tree misordered"
            );
            let m = Self::validate_active(pool, l, Some(n));
            if ts_gt(min, m) {
                min = m;
            }
        }
        if let Some(r) = pool[n].rb.right {
            assert!(
                !ts_gt(pool[n].finish, pool[r].finish),
                "active tree misordered"
            );
            let m = Self::validate_active(pool, r, Some(n));
            if ts_gt(min, m) {
                min = m;
            }
        }
        assert_eq!(pool[n].min_start, min, "stale min_start");
        min
    }
}
