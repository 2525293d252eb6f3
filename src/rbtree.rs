//! Ordered tree of entities, keyed by finish time.
//!
//! Red-black tree threaded through the link fields embedded in each entity,
//! so membership costs no allocation and an entity can sit on at most one
//! tree. Both the active and the idle set use the same ordering; the active
//! set additionally keeps `min_start` per node (minimum start time over the
//! subtree), which is what makes the eligible-with-smallest-finish lookup
//! logarithmic. Rotations refresh `min_start` for the two pivoted nodes;
//! structural updates outside rotations are repaired by walking from the
//! deepest modified node back to the root ([`update_active_tree`]).

use crate::entity::{EntityId, EntityPool, RbLinks};
use crate::vtime::ts_gt;

/// Root handle of one ordered tree.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RbRoot {
    pub(crate) root: Option<EntityId>,
}

impl RbRoot {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[inline]
fn is_red(pool: &EntityPool, n: Option<EntityId>) -> bool {
    // nil nodes are black
    n.is_some_and(|n| pool[n].rb.red)
}

// ---------------------------------------------------------------------------
// min_start augmentation
// ---------------------------------------------------------------------------

/// Recompute `min_start` of `n` from its own start time and its children,
/// which are assumed to hold correct values.
pub(crate) fn update_node(pool: &mut EntityPool, n: EntityId) {
    let mut min = pool[n].start;
    if let Some(r) = pool[n].rb.right {
        let m = pool[r].min_start;
        if ts_gt(min, m) {
            min = m;
        }
    }
    if let Some(l) = pool[n].rb.left {
        let m = pool[l].min_start;
        if ts_gt(min, m) {
            min = m;
        }
    }
    pool[n].min_start = min;
}

/// Repair `min_start` along the path from the deepest modified node to the
/// root. Only nodes on that path and their siblings can hold stale values
/// after an insertion or extraction, so refreshing exactly those suffices.
pub(crate) fn update_active_tree(pool: &mut EntityPool, mut node: EntityId) {
    loop {
        update_node(pool, node);
        let Some(parent) = pool[node].rb.parent else {
            return;
        };
        if pool[parent].rb.left == Some(node) {
            if let Some(r) = pool[parent].rb.right {
                update_node(pool, r);
            }
        } else if let Some(l) = pool[parent].rb.left {
            update_node(pool, l);
        }
        node = parent;
    }
}

// ---------------------------------------------------------------------------
// Rotations
// ---------------------------------------------------------------------------

fn rotate_left(pool: &mut EntityPool, root: &mut RbRoot, x: EntityId) {
    let y = pool[x].rb.right.expect("rotate_left without right child");
    let yl = pool[y].rb.left;

    pool[x].rb.right = yl;
    if let Some(yl) = yl {
        pool[yl].rb.parent = Some(x);
    }

    let xp = pool[x].rb.parent;
    pool[y].rb.parent = xp;
    match xp {
        None => root.root = Some(y),
        Some(p) => {
            if pool[p].rb.left == Some(x) {
                pool[p].rb.left = Some(y);
            } else {
                pool[p].rb.right = Some(y);
            }
        }
    }

    pool[y].rb.left = Some(x);
    pool[x].rb.parent = Some(y);

    // x dropped below y: refresh the pivots bottom-up
    update_node(pool, x);
    update_node(pool, y);
}

fn rotate_right(pool: &mut EntityPool, root: &mut RbRoot, x: EntityId) {
    let y = pool[x].rb.left.expect("rotate_right without left child");
    let yr = pool[y].rb.right;

    pool[x].rb.left = yr;
    if let Some(yr) = yr {
        pool[yr].rb.parent = Some(x);
    }

    let xp = pool[x].rb.parent;
    pool[y].rb.parent = xp;
    match xp {
        None => root.root = Some(y),
        Some(p) => {
            if pool[p].rb.left == Some(x) {
                pool[p].rb.left = Some(y);
            } else {
                pool[p].rb.right = Some(y);
            }
        }
    }

    pool[y].rb.right = Some(x);
    pool[x].rb.parent = Some(y);

    update_node(pool, x);
    update_node(pool, y);
}

// ---------------------------------------------------------------------------
// Insertion
// ---------------------------------------------------------------------------

/// Insert `id` keyed by its finish time, wrap-safe. Entities with equal
/// finish go to the right, preserving arrival order among ties.
pub(crate) fn insert(pool: &mut EntityPool, root: &mut RbRoot, id: EntityId) {
    debug_assert!(
        pool[id].rb.parent.is_none() && pool[id].rb.left.is_none() && pool[id].rb.right.is_none(),
        "inserting an entity that is already linked"
    );

    let key = pool[id].finish;
    let mut parent = None;
    let mut go_left = false;
    let mut cur = root.root;
    while let Some(c) = cur {
        parent = Some(c);
        go_left = ts_gt(pool[c].finish, key);
        cur = if go_left { pool[c].rb.left } else { pool[c].rb.right };
    }

    pool[id].rb = RbLinks {
        parent,
        left: None,
        right: None,
        red: true,
    };
    pool[id].min_start = pool[id].start;

    match parent {
        None => root.root = Some(id),
        Some(p) => {
            if go_left {
                pool[p].rb.left = Some(id);
            } else {
                pool[p].rb.right = Some(id);
            }
        }
    }

    insert_fixup(pool, root, id);
}

fn insert_fixup(pool: &mut EntityPool, root: &mut RbRoot, mut z: EntityId) {
    while is_red(pool, pool[z].rb.parent) {
        let p = pool[z].rb.parent.unwrap();
        let g = pool[p].rb.parent.expect("red node cannot be the root");
        if pool[g].rb.left == Some(p) {
            let uncle = pool[g].rb.right;
            if is_red(pool, uncle) {
                pool[p].rb.red = false;
                pool[uncle.unwrap()].rb.red = false;
                pool[g].rb.red = true;
                z = g;
            } else {
                if pool[p].rb.right == Some(z) {
                    z = p;
                    rotate_left(pool, root, z);
                }
                let p = pool[z].rb.parent.unwrap();
                let g = pool[p].rb.parent.unwrap();
                pool[p].rb.red = false;
                pool[g].rb.red = true;
                rotate_right(pool, root, g);
            }
        } else {
            let uncle = pool[g].rb.left;
            if is_red(pool, uncle) {
                pool[p].rb.red = false;
                pool[uncle.unwrap()].rb.red = false;
                pool[g].rb.red = true;
                z = g;
            } else {
                if pool[p].rb.left == Some(z) {
                    z = p;
                    rotate_right(pool, root, z);
                }
                let p = pool[z].rb.parent.unwrap();
                let g = pool[p].rb.parent.unwrap();
                pool[p].rb.red = false;
                pool[g].rb.red = true;
                rotate_left(pool, root, g);
            }
        }
    }
    let r = root.root.expect("fixup on an empty tree");
    pool[r].rb.red = false;
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

fn leftmost(pool: &EntityPool, mut n: EntityId) -> EntityId {
    while let Some(l) = pool[n].rb.left {
        n = l;
    }
    n
}

/// Entity with the smallest finish time, or `None` on an empty tree.
pub(crate) fn first(pool: &EntityPool, root: &RbRoot) -> Option<EntityId> {
    root.root.map(|r| leftmost(pool, r))
}

/// In-order successor.
pub(crate) fn next(pool: &EntityPool, n: EntityId) -> Option<EntityId> {
    if let Some(r) = pool[n].rb.right {
        return Some(leftmost(pool, r));
    }
    let mut cur = n;
    while let Some(p) = pool[cur].rb.parent {
        if pool[p].rb.right == Some(cur) {
            cur = p;
        } else {
            return Some(p);
        }
    }
    None
}

/// In-order predecessor.
pub(crate) fn prev(pool: &EntityPool, n: EntityId) -> Option<EntityId> {
    if let Some(l) = pool[n].rb.left {
        let mut cur = l;
        while let Some(r) = pool[cur].rb.right {
            cur = r;
        }
        return Some(cur);
    }
    let mut cur = n;
    while let Some(p) = pool[cur].rb.parent {
        if pool[p].rb.left == Some(cur) {
            cur = p;
        } else {
            return Some(p);
        }
    }
    None
}

/// First step of an extraction: the deepest node whose `min_start` may be
/// invalidated by removing `node` and rebalancing. `None` if `node` is the
/// last node in the tree.
pub(crate) fn find_deepest(pool: &EntityPool, node: EntityId) -> Option<EntityId> {
    match (pool[node].rb.left, pool[node].rb.right) {
        (None, None) => pool[node].rb.parent,
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (Some(_), Some(_)) => {
            let succ = next(pool, node).expect("a node with two children has a successor");
            if let Some(sr) = pool[succ].rb.right {
                Some(sr)
            } else if pool[succ].rb.parent != Some(node) {
                pool[succ].rb.parent
            } else {
                Some(succ)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn transplant(pool: &mut EntityPool, root: &mut RbRoot, u: EntityId, v: Option<EntityId>) {
    let up = pool[u].rb.parent;
    match up {
        None => root.root = v,
        Some(p) => {
            if pool[p].rb.left == Some(u) {
                pool[p].rb.left = v;
            } else {
                pool[p].rb.right = v;
            }
        }
    }
    if let Some(v) = v {
        pool[v].rb.parent = up;
    }
}

/// Remove `z` from the tree, leaving its links cleared. `min_start` values
/// along the affected path must be repaired by the caller via
/// [`update_active_tree`] (the idle tree does not need it).
pub(crate) fn erase(pool: &mut EntityPool, root: &mut RbRoot, z: EntityId) {
    let zl = pool[z].rb.left;
    let zr = pool[z].rb.right;

    let x;
    let x_parent;
    let removed_black;
    match (zl, zr) {
        (None, _) => {
            x = zr;
            x_parent = pool[z].rb.parent;
            removed_black = !pool[z].rb.red;
            transplant(pool, root, z, zr);
        }
        (_, None) => {
            x = zl;
            x_parent = pool[z].rb.parent;
            removed_black = !pool[z].rb.red;
            transplant(pool, root, z, zl);
        }
        (Some(zl), Some(zr)) => {
            // Replace z with its successor, which has no left child.
            let y = leftmost(pool, zr);
            removed_black = !pool[y].rb.red;
            x = pool[y].rb.right;
            if pool[y].rb.parent == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = pool[y].rb.parent;
                transplant(pool, root, y, x);
                pool[y].rb.right = Some(zr);
                pool[zr].rb.parent = Some(y);
            }
            transplant(pool, root, z, Some(y));
            pool[y].rb.left = Some(zl);
            pool[zl].rb.parent = Some(y);
            pool[y].rb.red = pool[z].rb.red;
        }
    }

    pool[z].rb = RbLinks::default();

    if removed_black {
        erase_fixup(pool, root, x, x_parent);
    }
}

fn erase_fixup(
    pool: &mut EntityPool,
    root: &mut RbRoot,
    mut x: Option<EntityId>,
    mut x_parent: Option<EntityId>,
) {
    while x != root.root && !is_red(pool, x) {
        let Some(p) = x_parent else {
            break;
        };
        if pool[p].rb.left == x {
            let mut w = pool[p].rb.right.expect("double-black node must have a sibling");
            if pool[w].rb.red {
                pool[w].rb.red = false;
                pool[p].rb.red = true;
                rotate_left(pool, root, p);
                w = pool[p].rb.right.expect("rotation preserves the sibling");
            }
            if !is_red(pool, pool[w].rb.left) && !is_red(pool, pool[w].rb.right) {
                pool[w].rb.red = true;
                x = Some(p);
                x_parent = pool[p].rb.parent;
            } else {
                if !is_red(pool, pool[w].rb.right) {
                    if let Some(wl) = pool[w].rb.left {
                        pool[wl].rb.red = false;
                    }
                    pool[w].rb.red = true;
                    rotate_right(pool, root, w);
                    w = pool[p].rb.right.expect("rotation preserves the sibling");
                }
                pool[w].rb.red = pool[p].rb.red;
                pool[p].rb.red = false;
                if let Some(wr) = pool[w].rb.right {
                    pool[wr].rb.red = false;
                }
                rotate_left(pool, root, p);
                x = root.root;
                x_parent = None;
            }
        } else {
            let mut w = pool[p].rb.left.expect("double-black node must have a sibling");
            if pool[w].rb.red {
                pool[w].rb.red = false;
                pool[p].rb.red = true;
                rotate_right(pool, root, p);
                w = pool[p].rb.left.expect("rotation preserves the sibling");
            }
            if !is_red(pool, pool[w].rb.left) && !is_red(pool, pool[w].rb.right) {
                pool[w].rb.red = true;
                x = Some(p);
                x_parent = pool[p].rb.parent;
            } else {
                if !is_red(pool, pool[w].rb.left) {
                    if let Some(wr) = pool[w].rb.right {
                        pool[wr].rb.red = false;
                    }
                    pool[w].rb.red = true;
                    rotate_left(pool, root, w);
                    w = pool[p].rb.left.expect("rotation preserves the sibling");
                }
                pool[w].rb.red = pool[p].rb.red;
                pool[p].rb.red = false;
                if let Some(wl) = pool[w].rb.left {
                    pool[wl].rb.red = false;
                }
                rotate_right(pool, root, p);
                x = root.root;
                x_parent = None;
            }
        }
    }
    if let Some(x) = x {
        pool[x].rb.red = false;
    }
}
