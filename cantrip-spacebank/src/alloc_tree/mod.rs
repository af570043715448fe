// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-bank index of allocated objects.
//!
//! Each bank records the frames charged to it in an AllocTree: a
//! red-black tree keyed by OID, where every tree node covers
//! FRAMES_PER_TREENODE consecutive frames and holds, for each frame,
//! a bitmap of allocated objects and the frame's base type. Tree nodes
//! live in a single TreeArena shared by every bank so whole subtrees
//! can be handed from one bank to another without copying.

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;
use cantrip_spacebank_interface::frame_of;
use cantrip_spacebank_interface::frame_oid;
use cantrip_spacebank_interface::index_in_frame;
use cantrip_spacebank_interface::BaseType;
use cantrip_spacebank_interface::Oid;
use cantrip_spacebank_interface::OBJECTS_PER_FRAME;
use log::trace;
use static_assertions::const_assert;

pub const FRAMES_PER_TREENODE: usize = 8;
pub const OBJECTS_PER_TREENODE: u64 = FRAMES_PER_TREENODE as u64 * OBJECTS_PER_FRAME;
const_assert!(OBJECTS_PER_TREENODE.is_power_of_two());

// Arena growth increment; freed nodes are recycled, never returned.
const TREE_NODE_CHUNK: usize = 8;

// Sentinel index; always black, never holds data.
const NIL: usize = 0;

// Key of the tree node covering |oid|.
fn tree_key(oid: Oid) -> Oid { oid & !(OBJECTS_PER_TREENODE - 1) }
// Frame slot within the tree node covering |oid|.
fn tree_slot(oid: Oid) -> usize { (frame_of(oid) % FRAMES_PER_TREENODE as u64) as usize }

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Debug)]
struct TreeNode {
    key: Oid,
    parent: usize,
    left: usize,
    right: usize,
    color: Color,
    generation: u32, // Bumped each time the node is freed
    map: [u32; FRAMES_PER_TREENODE],
    types: [Option<BaseType>; FRAMES_PER_TREENODE],
}
impl TreeNode {
    fn empty() -> Self {
        TreeNode {
            key: 0,
            parent: NIL,
            left: NIL,
            right: NIL,
            color: Color::Black,
            generation: 0,
            map: [0; FRAMES_PER_TREENODE],
            types: [None; FRAMES_PER_TREENODE],
        }
    }
    fn is_empty(&self) -> bool { self.map.iter().all(|m| *m == 0) }
    fn first_used_slot(&self) -> Option<usize> { self.map.iter().position(|m| *m != 0) }
}

#[derive(Debug, Eq, PartialEq)]
pub enum TreeError {
    NotFound,     // No tree entry for the frame
    NotAllocated, // Frame is tracked but the object is not allocated
}

// One frame's worth of allocation state removed from a tree.
#[derive(Debug, Eq, PartialEq)]
pub struct FrameSlot {
    pub frame_oid: Oid,
    pub base_type: BaseType,
    pub map: u32, // Allocated objects
}

// Storage for the tree nodes of all banks.
pub struct TreeArena {
    nodes: Vec<TreeNode>,
    free: Vec<usize>,
}
impl TreeArena {
    pub fn new() -> Self {
        TreeArena {
            nodes: vec![TreeNode::empty()], // NIL
            free: Vec::new(),
        }
    }

    // Tree nodes currently holding allocation state.
    pub fn live_nodes(&self) -> usize { self.nodes.len() - 1 - self.free.len() }

    fn new_node(&mut self, key: Oid) -> usize {
        if self.free.is_empty() {
            let first = self.nodes.len();
            self.nodes.resize(first + TREE_NODE_CHUNK, TreeNode::empty());
            // Push in reverse so the lowest index is handed out first.
            self.free.extend((first..first + TREE_NODE_CHUNK).rev());
        }
        let index = self.free.pop().unwrap_or(NIL);
        assert!(index != NIL, "tree arena exhausted");
        let node = &mut self.nodes[index];
        let generation = node.generation;
        *node = TreeNode::empty();
        node.generation = generation;
        node.key = key;
        index
    }

    fn delete_node(&mut self, index: usize) {
        assert!(index != NIL);
        let node = &mut self.nodes[index];
        node.generation = node.generation.wrapping_add(1);
        node.map = [0; FRAMES_PER_TREENODE];
        node.types = [None; FRAMES_PER_TREENODE];
        self.free.push(index);
    }

    fn color(&self, index: usize) -> Color { self.nodes[index].color }
    fn parent(&self, index: usize) -> usize { self.nodes[index].parent }
    fn left(&self, index: usize) -> usize { self.nodes[index].left }
    fn right(&self, index: usize) -> usize { self.nodes[index].right }
    fn node_ref(&self, index: usize) -> NodeRef {
        NodeRef {
            index,
            generation: self.nodes[index].generation,
        }
    }
}
impl Default for TreeArena {
    fn default() -> Self { Self::new() }
}

// Non-owning reference to a tree node; stale once the node is freed.
#[derive(Copy, Clone, Debug)]
struct NodeRef {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
pub struct AllocTree {
    root: usize,
    // Locality hints for sequential insert & remove.
    last_insert: Option<NodeRef>,
    last_remove: Option<NodeRef>,
}
impl Default for AllocTree {
    fn default() -> Self { Self::new() }
}
impl AllocTree {
    pub const fn new() -> Self {
        AllocTree {
            root: NIL,
            last_insert: None,
            last_remove: None,
        }
    }

    pub fn is_empty(&self) -> bool { self.root == NIL }

    fn clear_hints(&mut self) {
        self.last_insert = None;
        self.last_remove = None;
    }

    // Resolves |hint| if it still names the live node for |key|.
    fn hinted(arena: &TreeArena, hint: Option<NodeRef>, key: Oid) -> Option<usize> {
        hint.filter(|h| {
            let node = &arena.nodes[h.index];
            node.generation == h.generation && node.key == key
        })
        .map(|h| h.index)
    }

    fn find(&self, arena: &TreeArena, key: Oid) -> usize {
        let mut cur = self.root;
        while cur != NIL {
            let node = &arena.nodes[cur];
            if key == node.key {
                break;
            }
            cur = if key < node.key { node.left } else { node.right };
        }
        cur
    }

    // Marks |count| objects starting at |oid| as allocated with type
    // |base_type|. The objects must lie in one frame and must not already
    // be allocated; a frame holds objects of only one base type.
    pub fn insert_oids(&mut self, arena: &mut TreeArena, base_type: BaseType, oid: Oid, count: u32) {
        let obj = index_in_frame(oid);
        assert!(
            count > 0 && obj + count <= base_type.objects_per_frame(),
            "insert {:#x} count {} overflows {:?} frame",
            oid,
            count,
            base_type
        );
        let key = tree_key(oid);
        let index = match Self::hinted(arena, self.last_insert, key) {
            Some(index) => index,
            None => match self.find(arena, key) {
                NIL => {
                    let index = arena.new_node(key);
                    self.insert_node(arena, index);
                    index
                }
                index => index,
            },
        };
        self.last_insert = Some(arena.node_ref(index));

        let slot = tree_slot(oid);
        let node = &mut arena.nodes[index];
        if node.map[slot] != 0 && node.types[slot] != Some(base_type) {
            panic!(
                "insert {:#x} as {:?} into {:?} frame",
                oid, base_type, node.types[slot]
            );
        }
        let mask = (((1u64 << count) - 1) as u32) << obj;
        assert!(
            node.map[slot] & mask == 0,
            "insert {:#x} count {} overlaps {:#x}",
            oid,
            count,
            node.map[slot]
        );
        node.types[slot] = Some(base_type);
        node.map[slot] |= mask;
    }

    // Returns true if |oid| is allocated in this tree.
    pub fn check_for_oid(&mut self, arena: &TreeArena, oid: Oid) -> bool {
        let key = tree_key(oid);
        let index = match Self::hinted(arena, self.last_remove, key) {
            Some(index) => index,
            None => match self.find(arena, key) {
                NIL => return false,
                index => index,
            },
        };
        self.last_remove = Some(arena.node_ref(index));
        let map = arena.nodes[index].map[tree_slot(oid)];
        map & (1 << index_in_frame(oid)) != 0
    }

    // Marks |oid| free. If that empties its frame the frame's OID is
    // returned; the caller owns returning the frame to object space.
    pub fn remove_oid(
        &mut self,
        arena: &mut TreeArena,
        base_type: BaseType,
        oid: Oid,
    ) -> Result<Option<Oid>, TreeError> {
        let key = tree_key(oid);
        let index = match Self::hinted(arena, self.last_remove, key) {
            Some(index) => index,
            None => match self.find(arena, key) {
                NIL => return Err(TreeError::NotFound),
                index => index,
            },
        };
        self.last_remove = Some(arena.node_ref(index));

        let slot = tree_slot(oid);
        let node = &mut arena.nodes[index];
        let map = node.map[slot];
        if map == 0 {
            return Err(TreeError::NotFound);
        }
        if node.types[slot] != Some(base_type) {
            panic!(
                "remove {:#x} as {:?} from {:?} frame",
                oid, base_type, node.types[slot]
            );
        }
        let bit = 1 << index_in_frame(oid);
        if map & bit == 0 {
            return Err(TreeError::NotAllocated);
        }
        node.map[slot] = map & !bit;
        if node.map[slot] != 0 {
            return Ok(None);
        }
        node.types[slot] = None;
        if node.is_empty() {
            self.clear_hints();
            self.delete_node(arena, index);
            arena.delete_node(index);
        }
        Ok(Some(frame_oid(oid)))
    }

    // Moves every allocation in |src| to this tree; |src| is left empty.
    // A frame tracked by both trees is a fatal bookkeeping error.
    pub fn merge_from(&mut self, arena: &mut TreeArena, src: &mut AllocTree) {
        src.clear_hints();
        while src.root != NIL {
            let cur = src.root;
            src.delete_node(arena, cur);
            let key = arena.nodes[cur].key;
            match self.find(arena, key) {
                NIL => self.insert_node(arena, cur),
                dest => {
                    let map = arena.nodes[cur].map;
                    let types = arena.nodes[cur].types;
                    let node = &mut arena.nodes[dest];
                    for slot in 0..FRAMES_PER_TREENODE {
                        if map[slot] == 0 {
                            continue;
                        }
                        assert!(
                            node.map[slot] == 0,
                            "merge conflict on frame {:#x}",
                            key + slot as u64 * OBJECTS_PER_FRAME
                        );
                        node.map[slot] = map[slot];
                        node.types[slot] = types[slot];
                    }
                    arena.delete_node(cur);
                }
            }
        }
    }

    // Returns some allocated object in the tree, or None if the tree
    // is empty.
    #[cfg_attr(not(feature = "CONFIG_DESTROY_BY_OBJECT"), allow(dead_code))]
    pub fn find_oid(&self, arena: &TreeArena) -> Option<(Oid, BaseType)> {
        if self.root == NIL {
            return None;
        }
        let node = &arena.nodes[self.root];
        let slot = match node.first_used_slot() {
            Some(slot) => slot,
            None => panic!("empty tree node {:#x}", node.key),
        };
        let frame = node.key + slot as u64 * OBJECTS_PER_FRAME;
        let base_type = match node.types[slot] {
            Some(base_type) => base_type,
            None => panic!("untyped slot {} in tree node {:#x}", slot, node.key),
        };
        Some((frame + node.map[slot].trailing_zeros() as u64, base_type))
    }

    // Removes one frame from the tree and returns its state, or None
    // once the tree is empty. Each call does a bounded amount of work so
    // a large tree can be torn down a step at a time.
    #[cfg_attr(feature = "CONFIG_DESTROY_BY_OBJECT", allow(dead_code))]
    pub fn incremental_destroy(&mut self, arena: &mut TreeArena) -> Option<FrameSlot> {
        self.clear_hints();
        if self.root == NIL {
            return None;
        }
        let index = self.root;
        let node = &mut arena.nodes[index];
        let slot = match node.first_used_slot() {
            Some(slot) => slot,
            None => panic!("empty tree node {:#x}", node.key),
        };
        let base_type = match node.types[slot] {
            Some(base_type) => base_type,
            None => panic!("untyped slot {} in tree node {:#x}", slot, node.key),
        };
        let frame = FrameSlot {
            frame_oid: node.key + slot as u64 * OBJECTS_PER_FRAME,
            base_type,
            map: node.map[slot],
        };
        node.map[slot] = 0;
        node.types[slot] = None;
        if node.is_empty() {
            self.delete_node(arena, index);
            arena.delete_node(index);
        }
        Some(frame)
    }

    // Number of frames tracked by the tree.
    pub fn frame_count(&self, arena: &TreeArena) -> usize {
        let mut count = 0;
        let mut stack = Vec::new();
        if self.root != NIL {
            stack.push(self.root);
        }
        while let Some(cur) = stack.pop() {
            let node = &arena.nodes[cur];
            count += node.map.iter().filter(|m| **m != 0).count();
            for child in [node.left, node.right] {
                if child != NIL {
                    stack.push(child);
                }
            }
        }
        count
    }

    fn rotate_left(&mut self, arena: &mut TreeArena, x: usize) {
        let y = arena.right(x);
        let y_left = arena.left(y);
        arena.nodes[x].right = y_left;
        if y_left != NIL {
            arena.nodes[y_left].parent = x;
        }
        let xp = arena.parent(x);
        arena.nodes[y].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if x == arena.left(xp) {
            arena.nodes[xp].left = y;
        } else {
            arena.nodes[xp].right = y;
        }
        arena.nodes[y].left = x;
        arena.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, arena: &mut TreeArena, x: usize) {
        let y = arena.left(x);
        let y_right = arena.right(y);
        arena.nodes[x].left = y_right;
        if y_right != NIL {
            arena.nodes[y_right].parent = x;
        }
        let xp = arena.parent(x);
        arena.nodes[y].parent = xp;
        if xp == NIL {
            self.root = y;
        } else if x == arena.right(xp) {
            arena.nodes[xp].right = y;
        } else {
            arena.nodes[xp].left = y;
        }
        arena.nodes[y].right = x;
        arena.nodes[x].parent = y;
    }

    // Links node |z| into the tree and rebalances.
    fn insert_node(&mut self, arena: &mut TreeArena, z: usize) {
        trace!("tree insert {:#x}", arena.nodes[z].key);
        let key = arena.nodes[z].key;
        let mut parent = NIL;
        let mut cur = self.root;
        while cur != NIL {
            parent = cur;
            cur = if key < arena.nodes[cur].key { arena.left(cur) } else { arena.right(cur) };
        }
        {
            let node = &mut arena.nodes[z];
            node.parent = parent;
            node.left = NIL;
            node.right = NIL;
            node.color = Color::Red;
        }
        if parent == NIL {
            self.root = z;
        } else if key < arena.nodes[parent].key {
            arena.nodes[parent].left = z;
        } else {
            arena.nodes[parent].right = z;
        }

        let mut z = z;
        while arena.color(arena.parent(z)) == Color::Red {
            let zp = arena.parent(z);
            let zpp = arena.parent(zp);
            if zp == arena.left(zpp) {
                let uncle = arena.right(zpp);
                if arena.color(uncle) == Color::Red {
                    arena.nodes[zp].color = Color::Black;
                    arena.nodes[uncle].color = Color::Black;
                    arena.nodes[zpp].color = Color::Red;
                    z = zpp;
                } else {
                    if z == arena.right(zp) {
                        z = zp;
                        self.rotate_left(arena, z);
                    }
                    let zp = arena.parent(z);
                    let zpp = arena.parent(zp);
                    arena.nodes[zp].color = Color::Black;
                    arena.nodes[zpp].color = Color::Red;
                    self.rotate_right(arena, zpp);
                }
            } else {
                let uncle = arena.left(zpp);
                if arena.color(uncle) == Color::Red {
                    arena.nodes[zp].color = Color::Black;
                    arena.nodes[uncle].color = Color::Black;
                    arena.nodes[zpp].color = Color::Red;
                    z = zpp;
                } else {
                    if z == arena.left(zp) {
                        z = zp;
                        self.rotate_right(arena, z);
                    }
                    let zp = arena.parent(z);
                    let zpp = arena.parent(zp);
                    arena.nodes[zp].color = Color::Black;
                    arena.nodes[zpp].color = Color::Red;
                    self.rotate_left(arena, zpp);
                }
            }
        }
        let root = self.root;
        arena.nodes[root].color = Color::Black;
    }

    // Replaces the subtree rooted at |u| with the one rooted at |v|.
    fn transplant(&mut self, arena: &mut TreeArena, u: usize, v: usize) {
        let up = arena.parent(u);
        if up == NIL {
            self.root = v;
        } else if u == arena.left(up) {
            arena.nodes[up].left = v;
        } else {
            arena.nodes[up].right = v;
        }
        // NB: may write the sentinel's parent; delete fixup relies on it.
        arena.nodes[v].parent = up;
    }

    // Unlinks node |z| from the tree and rebalances. The node itself is
    // left for the caller to free or relink.
    fn delete_node(&mut self, arena: &mut TreeArena, z: usize) {
        trace!("tree delete {:#x}", arena.nodes[z].key);
        let mut removed_color = arena.color(z);
        let x;
        if arena.left(z) == NIL {
            x = arena.right(z);
            self.transplant(arena, z, x);
        } else if arena.right(z) == NIL {
            x = arena.left(z);
            self.transplant(arena, z, x);
        } else {
            let mut y = arena.right(z);
            while arena.left(y) != NIL {
                y = arena.left(y);
            }
            removed_color = arena.color(y);
            x = arena.right(y);
            if arena.parent(y) == z {
                arena.nodes[x].parent = y;
            } else {
                self.transplant(arena, y, x);
                let zr = arena.right(z);
                arena.nodes[y].right = zr;
                arena.nodes[zr].parent = y;
            }
            self.transplant(arena, z, y);
            let zl = arena.left(z);
            arena.nodes[y].left = zl;
            arena.nodes[zl].parent = y;
            arena.nodes[y].color = arena.color(z);
        }
        if removed_color == Color::Black {
            self.delete_fixup(arena, x);
        }
        let node = &mut arena.nodes[z];
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
    }

    fn delete_fixup(&mut self, arena: &mut TreeArena, x: usize) {
        let mut x = x;
        while x != self.root && arena.color(x) == Color::Black {
            let xp = arena.parent(x);
            if x == arena.left(xp) {
                let mut w = arena.right(xp);
                if arena.color(w) == Color::Red {
                    arena.nodes[w].color = Color::Black;
                    arena.nodes[xp].color = Color::Red;
                    self.rotate_left(arena, xp);
                    w = arena.right(arena.parent(x));
                }
                if arena.color(arena.left(w)) == Color::Black
                    && arena.color(arena.right(w)) == Color::Black
                {
                    arena.nodes[w].color = Color::Red;
                    x = arena.parent(x);
                } else {
                    if arena.color(arena.right(w)) == Color::Black {
                        let wl = arena.left(w);
                        arena.nodes[wl].color = Color::Black;
                        arena.nodes[w].color = Color::Red;
                        self.rotate_right(arena, w);
                        w = arena.right(arena.parent(x));
                    }
                    let xp = arena.parent(x);
                    arena.nodes[w].color = arena.color(xp);
                    arena.nodes[xp].color = Color::Black;
                    let wr = arena.right(w);
                    arena.nodes[wr].color = Color::Black;
                    self.rotate_left(arena, xp);
                    x = self.root;
                }
            } else {
                let mut w = arena.left(xp);
                if arena.color(w) == Color::Red {
                    arena.nodes[w].color = Color::Black;
                    arena.nodes[xp].color = Color::Red;
                    self.rotate_right(arena, xp);
                    w = arena.left(arena.parent(x));
                }
                if arena.color(arena.right(w)) == Color::Black
                    && arena.color(arena.left(w)) == Color::Black
                {
                    arena.nodes[w].color = Color::Red;
                    x = arena.parent(x);
                } else {
                    if arena.color(arena.left(w)) == Color::Black {
                        let wr = arena.right(w);
                        arena.nodes[wr].color = Color::Black;
                        arena.nodes[w].color = Color::Red;
                        self.rotate_left(arena, w);
                        w = arena.left(arena.parent(x));
                    }
                    let xp = arena.parent(x);
                    arena.nodes[w].color = arena.color(xp);
                    arena.nodes[xp].color = Color::Black;
                    let wl = arena.left(w);
                    arena.nodes[wl].color = Color::Black;
                    self.rotate_right(arena, xp);
                    x = self.root;
                }
            }
        }
        arena.nodes[x].color = Color::Black;
    }
}
