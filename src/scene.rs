use crate::error::{AnimResult, AnimationError};
use glam::Mat4;
use smallvec::SmallVec;

pub type NodeIndex = u32;

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub index: NodeIndex,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub local: Mat4,
    pub world: Mat4,
    pub mesh: Option<u32>,
    pub skin: Option<u32>,
    dirty: bool,
}

impl SceneNode {
    fn new(index: NodeIndex, parent: Option<NodeIndex>, mesh: Option<u32>, skin: Option<u32>) -> Self {
        Self {
            index,
            parent,
            children: Vec::new(),
            local: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            mesh,
            skin,
            dirty: true,
        }
    }

    /// True when this node's own local matrix changed since the last flush.
    /// Descendants of a dirty node are refreshed too even though their flag is clear.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Description of one node when building a graph in bulk.
#[derive(Clone, Copy, Debug)]
pub struct NodeSeed {
    pub parent: Option<NodeIndex>,
    pub local: Mat4,
    pub mesh: Option<u32>,
    pub skin: Option<u32>,
}

type PropagationStack = SmallVec<[(NodeIndex, Mat4, bool); 64]>;

/// Forest of nodes addressed by stable indices. Removed nodes leave a hole so
/// indices held elsewhere resolve to `NodeNotFound` instead of another node.
#[derive(Clone, Debug, Default)]
pub struct SceneGraph {
    nodes: Vec<Option<SceneNode>>,
    roots: Vec<NodeIndex>,
    dirty_nodes: usize,
    stack: PropagationStack,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { nodes: Vec::with_capacity(capacity), ..Self::default() }
    }

    /// Builds a graph whose indices match the seed order. Parents may appear after
    /// their children; the hierarchy must still be an acyclic forest.
    pub fn from_seeds(seeds: &[NodeSeed]) -> AnimResult<Self> {
        let mut graph = Self::with_capacity(seeds.len());
        for (index, seed) in seeds.iter().enumerate() {
            let mut node = SceneNode::new(index as NodeIndex, seed.parent, seed.mesh, seed.skin);
            node.local = seed.local;
            graph.nodes.push(Some(node));
        }
        graph.dirty_nodes = seeds.len();
        for (index, seed) in seeds.iter().enumerate() {
            let index = index as NodeIndex;
            match seed.parent {
                Some(parent) => {
                    if parent == index {
                        return Err(AnimationError::CycleDetected { node: index, parent });
                    }
                    let parent_node = graph.slot_mut(parent).map_err(|_| AnimationError::InvalidParent(parent))?;
                    parent_node.children.push(index);
                }
                None => graph.roots.push(index),
            }
        }
        let reachable = graph.count_reachable();
        if reachable != seeds.len() {
            return Err(AnimationError::MalformedModel(format!(
                "node hierarchy contains a cycle ({} of {} nodes reachable from roots)",
                reachable,
                seeds.len()
            )));
        }
        Ok(graph)
    }

    pub fn create_node(
        &mut self,
        parent: Option<NodeIndex>,
        mesh: Option<u32>,
        skin: Option<u32>,
    ) -> AnimResult<NodeIndex> {
        if let Some(parent) = parent {
            if self.node(parent).is_none() {
                return Err(AnimationError::InvalidParent(parent));
            }
        }
        let index = self.nodes.len() as NodeIndex;
        self.nodes.push(Some(SceneNode::new(index, parent, mesh, skin)));
        self.dirty_nodes += 1;
        match parent {
            Some(parent) => self.slot_mut(parent)?.children.push(index),
            None => self.roots.push(index),
        }
        Ok(index)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&SceneNode> {
        self.nodes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        self.node(index).is_some()
    }

    /// Number of slots ever allocated, including removed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn has_pending_updates(&self) -> bool {
        self.dirty_nodes > 0
    }

    pub fn set_local_matrix(&mut self, index: NodeIndex, matrix: Mat4) -> AnimResult<()> {
        let node = self.slot_mut(index)?;
        node.local = matrix;
        if !node.dirty {
            node.dirty = true;
            self.dirty_nodes += 1;
        }
        Ok(())
    }

    pub fn local_matrix(&self, index: NodeIndex) -> AnimResult<Mat4> {
        self.node(index).map(|node| node.local).ok_or(AnimationError::NodeNotFound(index))
    }

    /// World matrix as of the last `update_world_matrices`.
    pub fn world_matrix(&self, index: NodeIndex) -> AnimResult<Mat4> {
        self.node(index).map(|node| node.world).ok_or(AnimationError::NodeNotFound(index))
    }

    /// Recomputes world matrices for every node that is dirty or sits below a dirty
    /// ancestor, parents before children. Returns the number of nodes refreshed.
    pub fn update_world_matrices(&mut self) -> usize {
        if self.dirty_nodes == 0 {
            return 0;
        }
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();
        for &root in self.roots.iter().rev() {
            stack.push((root, Mat4::IDENTITY, false));
        }

        let mut updated = 0usize;
        while let Some((index, parent_world, parent_dirty)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(index as usize).and_then(Option::as_mut) else {
                continue;
            };
            let dirty = parent_dirty || node.dirty;
            if dirty {
                node.world = parent_world * node.local;
                node.dirty = false;
                updated += 1;
            }
            let world = node.world;
            for &child in node.children.iter().rev() {
                stack.push((child, world, dirty));
            }
        }

        self.stack = stack;
        self.dirty_nodes = 0;
        updated
    }

    /// Copies world matrices in index order; removed slots yield identity.
    pub fn copy_world_matrices(&self, out: &mut Vec<Mat4>) {
        out.clear();
        out.extend(self.nodes.iter().map(|slot| slot.as_ref().map_or(Mat4::IDENTITY, |node| node.world)));
    }

    pub fn reparent_node(&mut self, index: NodeIndex, new_parent: Option<NodeIndex>) -> AnimResult<()> {
        if !self.contains(index) {
            return Err(AnimationError::NodeNotFound(index));
        }
        if let Some(parent) = new_parent {
            if !self.contains(parent) {
                return Err(AnimationError::InvalidParent(parent));
            }
            if self.is_self_or_descendant(parent, index) {
                return Err(AnimationError::CycleDetected { node: index, parent });
            }
        }

        self.detach(index)?;
        match new_parent {
            Some(parent) => self.slot_mut(parent)?.children.push(index),
            None => self.roots.push(index),
        }
        let node = self.slot_mut(index)?;
        node.parent = new_parent;
        if !node.dirty {
            node.dirty = true;
            self.dirty_nodes += 1;
        }
        Ok(())
    }

    /// Removes `index` and its whole subtree. Returns the removed indices, ascending.
    pub fn remove_node(&mut self, index: NodeIndex) -> AnimResult<Vec<NodeIndex>> {
        if !self.contains(index) {
            return Err(AnimationError::NodeNotFound(index));
        }
        self.detach(index)?;

        let mut removed = Vec::new();
        let mut pending: SmallVec<[NodeIndex; 32]> = SmallVec::new();
        pending.push(index);
        while let Some(current) = pending.pop() {
            let Some(node) = self.nodes.get_mut(current as usize).and_then(Option::take) else {
                continue;
            };
            if node.dirty {
                self.dirty_nodes = self.dirty_nodes.saturating_sub(1);
            }
            pending.extend(node.children.iter().copied());
            removed.push(current);
        }
        removed.sort_unstable();
        Ok(removed)
    }

    pub fn find_nodes_by_mesh(&self, mesh: u32) -> Vec<NodeIndex> {
        self.nodes.iter().flatten().filter(|node| node.mesh == Some(mesh)).map(|node| node.index).collect()
    }

    pub fn find_nodes_by_skin(&self, skin: u32) -> Vec<NodeIndex> {
        self.nodes.iter().flatten().filter(|node| node.skin == Some(skin)).map(|node| node.index).collect()
    }

    fn slot_mut(&mut self, index: NodeIndex) -> AnimResult<&mut SceneNode> {
        self.nodes.get_mut(index as usize).and_then(Option::as_mut).ok_or(AnimationError::NodeNotFound(index))
    }

    fn detach(&mut self, index: NodeIndex) -> AnimResult<()> {
        let parent = self.node(index).ok_or(AnimationError::NodeNotFound(index))?.parent;
        match parent {
            Some(parent) => {
                if let Ok(parent_node) = self.slot_mut(parent) {
                    parent_node.children.retain(|&child| child != index);
                }
            }
            None => self.roots.retain(|&root| root != index),
        }
        Ok(())
    }

    /// Walks up from `candidate`; true if `ancestor` is found on the way (or is `candidate`).
    fn is_self_or_descendant(&self, candidate: NodeIndex, ancestor: NodeIndex) -> bool {
        let mut cursor = Some(candidate);
        let mut steps = 0usize;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                return true;
            }
            cursor = self.node(current).and_then(|node| node.parent);
        }
        false
    }

    fn count_reachable(&self) -> usize {
        let mut visited = vec![false; self.nodes.len()];
        let mut pending: Vec<NodeIndex> = self.roots.clone();
        let mut count = 0usize;
        while let Some(index) = pending.pop() {
            let slot = index as usize;
            if visited[slot] {
                continue;
            }
            visited[slot] = true;
            count += 1;
            if let Some(node) = self.node(index) {
                pending.extend(node.children.iter().copied());
            }
        }
        count
    }
}
