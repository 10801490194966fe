//! Red-black index over descriptor ids.
//!
//! Both engine trees (stable and unstable) are instances of [`PageTree`].
//! Node links are embedded in the descriptor ([`TreeNode`]), addressed by
//! [`DescId`], and a descriptor occupies at most one tree at a time.
//!
//! The tree stores no keys. Descent is driven by the caller — the key
//! protocol differs between checksum mode and content mode, and a walk must
//! be able to prune stale entries and restart — so the API is split into
//! caller-side navigation ([`root`](PageTree::root), [`child`](PageTree::child))
//! and tree-side structure edits ([`insert_at`](PageTree::insert_at),
//! [`unlink`](PageTree::unlink)). `unlink` needs no key either, which is what
//! lets deletion work on entries whose content drifted after insertion.

use crate::desc::{DescArena, DescId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

/// Descent/attachment direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Left,
    Right,
}

/// Tree link slot embedded in each descriptor.
#[derive(Debug)]
pub struct TreeNode {
    parent: Option<DescId>,
    left: Option<DescId>,
    right: Option<DescId>,
    color: Color,
    linked: bool,
}

impl TreeNode {
    pub const fn new() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            color: Color::Red,
            linked: false,
        }
    }

    /// True if this descriptor is in neither tree.
    #[inline]
    pub fn is_unlinked(&self) -> bool {
        !self.linked
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for TreeNode {
    fn default() -> Self {
        Self::new()
    }
}

/// One red-black tree threaded through descriptor node slots.
#[derive(Debug, Default)]
pub struct PageTree {
    root: Option<DescId>,
    len: u64,
}

impl PageTree {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[inline]
    pub fn root(&self) -> Option<DescId> {
        self.root
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Child of `id` in the given direction.
    #[inline]
    pub fn child(&self, arena: &DescArena, id: DescId, dir: Dir) -> Option<DescId> {
        let n = &arena.get(id).node;
        match dir {
            Dir::Left => n.left,
            Dir::Right => n.right,
        }
    }

    /// Leftmost descriptor, or `None` on an empty tree.
    pub fn first(&self, arena: &DescArena) -> Option<DescId> {
        self.root.map(|r| self.subtree_min(arena, r))
    }

    /// In-order successor of `id`.
    pub fn next(&self, arena: &DescArena, id: DescId) -> Option<DescId> {
        if let Some(r) = arena.get(id).node.right {
            return Some(self.subtree_min(arena, r));
        }
        let mut cur = id;
        let mut parent = arena.get(cur).node.parent;
        while let Some(p) = parent {
            if arena.get(p).node.left == Some(cur) {
                return Some(p);
            }
            cur = p;
            parent = arena.get(cur).node.parent;
        }
        None
    }

    /// Attach `id` at the empty slot `(parent, dir)` found during a descent
    /// and rebalance. With `parent == None` the tree must be empty.
    pub fn insert_at(&mut self, arena: &mut DescArena, parent: Option<DescId>, dir: Dir, id: DescId) {
        assert!(
            arena.get(id).node.is_unlinked(),
            "inserting descriptor already in a tree"
        );
        {
            let n = &mut arena.get_mut(id).node;
            n.parent = parent;
            n.left = None;
            n.right = None;
            n.color = Color::Red;
            n.linked = true;
        }
        match parent {
            None => {
                assert!(self.root.is_none(), "insert_at(None) on non-empty tree");
                self.root = Some(id);
            }
            Some(p) => {
                let pn = &mut arena.get_mut(p).node;
                let slot = match dir {
                    Dir::Left => &mut pn.left,
                    Dir::Right => &mut pn.right,
                };
                assert!(slot.is_none(), "insert_at over occupied slot");
                *slot = Some(id);
            }
        }
        self.len += 1;
        self.fix_insert(arena, id);
    }

    /// Remove `id` from the tree and rebalance. Key-free: works on entries
    /// whose content no longer matches their position.
    pub fn unlink(&mut self, arena: &mut DescArena, z: DescId) {
        assert!(!arena.get(z).node.is_unlinked(), "unlinking descriptor not in tree");

        let z_left = arena.get(z).node.left;
        let z_right = arena.get(z).node.right;

        let (x, xp, removed_color);
        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                xp = arena.get(z).node.parent;
                removed_color = arena.get(z).node.color;
                self.transplant(arena, z, x);
            }
            (_, None) => {
                x = z_left;
                xp = arena.get(z).node.parent;
                removed_color = arena.get(z).node.color;
                self.transplant(arena, z, x);
            }
            (Some(_), Some(zr)) => {
                let y = self.subtree_min(arena, zr);
                removed_color = arena.get(y).node.color;
                x = arena.get(y).node.right;
                if arena.get(y).node.parent == Some(z) {
                    xp = Some(y);
                } else {
                    xp = arena.get(y).node.parent;
                    self.transplant(arena, y, x);
                    arena.get_mut(y).node.right = Some(zr);
                    arena.get_mut(zr).node.parent = Some(y);
                }
                self.transplant(arena, z, Some(y));
                let zl = arena.get(z).node.left.expect("left child vanished");
                arena.get_mut(y).node.left = Some(zl);
                arena.get_mut(zl).node.parent = Some(y);
                arena.get_mut(y).node.color = arena.get(z).node.color;
            }
        }

        if removed_color == Color::Black {
            self.fix_unlink(arena, x, xp);
        }
        arena.get_mut(z).node.reset();
        self.len -= 1;
    }

    fn subtree_min(&self, arena: &DescArena, mut id: DescId) -> DescId {
        while let Some(l) = arena.get(id).node.left {
            id = l;
        }
        id
    }

    /// Replace the subtree rooted at `u` with `v` in `u`'s parent.
    fn transplant(&mut self, arena: &mut DescArena, u: DescId, v: Option<DescId>) {
        let up = arena.get(u).node.parent;
        match up {
            None => self.root = v,
            Some(p) => {
                let pn = &mut arena.get_mut(p).node;
                if pn.left == Some(u) {
                    pn.left = v;
                } else {
                    debug_assert_eq!(pn.right, Some(u));
                    pn.right = v;
                }
            }
        }
        if let Some(v) = v {
            arena.get_mut(v).node.parent = up;
        }
    }

    fn rotate(&mut self, arena: &mut DescArena, x: DescId, dir: Dir) {
        // dir == Left: y = x.right rises; mirror for Right.
        let y = match dir {
            Dir::Left => arena.get(x).node.right,
            Dir::Right => arena.get(x).node.left,
        }
        .expect("rotation without inner child");

        let inner = match dir {
            Dir::Left => arena.get(y).node.left,
            Dir::Right => arena.get(y).node.right,
        };
        match dir {
            Dir::Left => arena.get_mut(x).node.right = inner,
            Dir::Right => arena.get_mut(x).node.left = inner,
        }
        if let Some(i) = inner {
            arena.get_mut(i).node.parent = Some(x);
        }

        let xp = arena.get(x).node.parent;
        arena.get_mut(y).node.parent = xp;
        match xp {
            None => self.root = Some(y),
            Some(p) => {
                let pn = &mut arena.get_mut(p).node;
                if pn.left == Some(x) {
                    pn.left = Some(y);
                } else {
                    pn.right = Some(y);
                }
            }
        }

        match dir {
            Dir::Left => arena.get_mut(y).node.left = Some(x),
            Dir::Right => arena.get_mut(y).node.right = Some(x),
        }
        arena.get_mut(x).node.parent = Some(y);
    }

    fn color_of(&self, arena: &DescArena, id: Option<DescId>) -> Color {
        id.map_or(Color::Black, |n| arena.get(n).node.color)
    }

    fn fix_insert(&mut self, arena: &mut DescArena, mut z: DescId) {
        loop {
            let Some(p) = arena.get(z).node.parent else { break };
            if arena.get(p).node.color == Color::Black {
                break;
            }
            // Red parent implies a (black) grandparent: the root is black.
            let g = arena.get(p).node.parent.expect("red node at root");
            let parent_is_left = arena.get(g).node.left == Some(p);
            let (side, other) = if parent_is_left {
                (Dir::Left, Dir::Right)
            } else {
                (Dir::Right, Dir::Left)
            };

            let uncle = self.child(arena, g, other);
            if self.color_of(arena, uncle) == Color::Red {
                arena.get_mut(p).node.color = Color::Black;
                arena.get_mut(uncle.unwrap()).node.color = Color::Black;
                arena.get_mut(g).node.color = Color::Red;
                z = g;
                continue;
            }

            if self.child(arena, p, other) == Some(z) {
                // Inner grandchild: rotate it outward first.
                z = p;
                self.rotate(arena, z, side);
            }
            let p = arena.get(z).node.parent.expect("rotated node lost parent");
            let g = arena.get(p).node.parent.expect("rotated node lost grandparent");
            arena.get_mut(p).node.color = Color::Black;
            arena.get_mut(g).node.color = Color::Red;
            self.rotate(arena, g, other);
        }
        let root = self.root.expect("fix_insert on empty tree");
        arena.get_mut(root).node.color = Color::Black;
    }

    fn fix_unlink(&mut self, arena: &mut DescArena, mut x: Option<DescId>, mut xp: Option<DescId>) {
        while let Some(p) = xp {
            if self.color_of(arena, x) == Color::Red {
                break;
            }
            let x_is_left = arena.get(p).node.left == x;
            let (side, other) = if x_is_left {
                (Dir::Left, Dir::Right)
            } else {
                (Dir::Right, Dir::Left)
            };

            let mut w = self
                .child(arena, p, other)
                .expect("double-black node without sibling");

            if arena.get(w).node.color == Color::Red {
                arena.get_mut(w).node.color = Color::Black;
                arena.get_mut(p).node.color = Color::Red;
                self.rotate(arena, p, side);
                w = self
                    .child(arena, p, other)
                    .expect("sibling vanished after rotation");
            }

            let w_near = self.child(arena, w, side);
            let w_far = self.child(arena, w, other);
            if self.color_of(arena, w_near) == Color::Black
                && self.color_of(arena, w_far) == Color::Black
            {
                arena.get_mut(w).node.color = Color::Red;
                x = Some(p);
                xp = arena.get(p).node.parent;
                continue;
            }

            if self.color_of(arena, w_far) == Color::Black {
                if let Some(near) = w_near {
                    arena.get_mut(near).node.color = Color::Black;
                }
                arena.get_mut(w).node.color = Color::Red;
                self.rotate(arena, w, other);
                w = self
                    .child(arena, p, other)
                    .expect("sibling vanished after rotation");
            }

            arena.get_mut(w).node.color = arena.get(p).node.color;
            arena.get_mut(p).node.color = Color::Black;
            if let Some(far) = self.child(arena, w, other) {
                arena.get_mut(far).node.color = Color::Black;
            }
            self.rotate(arena, p, side);
            x = self.root;
            xp = None;
        }
        if let Some(x) = x {
            arena.get_mut(x).node.color = Color::Black;
        }
    }
}
