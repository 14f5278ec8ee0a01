use crate::animation::PoseEvaluator;
use crate::error::{AnimResult, AnimationError};
use crate::instance::InstanceId;
use crate::pose::{matrices_as_floats, NodeTransform, PoseOutputs, PoseSnapshot};
use crate::scene::NodeIndex;
use glam::Mat4;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoseSource {
    Inline,
    Worker,
}

/// Last published pose of one instance.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub instance: InstanceId,
    pub generation: u64,
    pub node_transforms: Vec<NodeTransform>,
    pub world_matrices: Vec<Mat4>,
    pub bone_matrices: Vec<Mat4>,
    pub source: PoseSource,
}

impl CacheEntry {
    fn empty(instance: InstanceId, source: PoseSource) -> Self {
        Self {
            instance,
            generation: 0,
            node_transforms: Vec::new(),
            world_matrices: Vec::new(),
            bone_matrices: Vec::new(),
            source,
        }
    }

    pub fn bone_floats(&self) -> &[f32] {
        matrices_as_floats(&self.bone_matrices)
    }
}

/// Instance → pose store read by the renderer every frame.
///
/// Every evaluation reserves a generation before it runs; a publish is accepted only
/// if its generation is newer than the last accepted one for that instance. The
/// accepted high-water mark outlives `invalidate`, and deleted instances are
/// remembered so late worker replies for them are ignored.
#[derive(Default)]
pub struct ResultCache {
    entries: HashMap<InstanceId, CacheEntry>,
    accepted: HashMap<InstanceId, u64>,
    issued: HashMap<InstanceId, u64>,
    dead: HashSet<InstanceId>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next generation for `instance`, strictly greater than any issued before.
    pub fn reserve_generation(&mut self, instance: InstanceId) -> u64 {
        let counter = self.issued.entry(instance).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn accepts(&self, instance: InstanceId, generation: u64) -> bool {
        !self.dead.contains(&instance) && generation > self.accepted.get(&instance).copied().unwrap_or(0)
    }

    /// Copies the evaluator's current pose into the cache, reusing the entry's buffers.
    pub fn publish_pose(
        &mut self,
        instance: InstanceId,
        generation: u64,
        pose: &PoseEvaluator,
        outputs: PoseOutputs,
        source: PoseSource,
    ) -> bool {
        if !self.accepts(instance, generation) {
            return false;
        }
        let entry = self.entries.entry(instance).or_insert_with(|| CacheEntry::empty(instance, source));
        if outputs.contains(PoseOutputs::NODE_TRANSFORMS) {
            entry.node_transforms.clear();
            entry.node_transforms.extend_from_slice(pose.node_transforms());
        }
        if outputs.contains(PoseOutputs::WORLD_MATRICES) {
            entry.world_matrices.clear();
            entry.world_matrices.extend_from_slice(pose.world_matrices());
        }
        if outputs.contains(PoseOutputs::BONE_MATRICES) {
            entry.bone_matrices.clear();
            entry.bone_matrices.extend_from_slice(pose.bone_matrices());
        }
        entry.generation = generation;
        entry.source = source;
        self.accepted.insert(instance, generation);
        true
    }

    /// Stores a pose that arrived by value. Missing bone matrices keep the previous ones.
    pub fn publish_snapshot(
        &mut self,
        instance: InstanceId,
        generation: u64,
        snapshot: PoseSnapshot,
        source: PoseSource,
    ) -> bool {
        if !self.accepts(instance, generation) {
            return false;
        }
        let entry = self.entries.entry(instance).or_insert_with(|| CacheEntry::empty(instance, source));
        entry.node_transforms = snapshot.node_transforms;
        entry.world_matrices = snapshot.world_matrices;
        if let Some(bones) = snapshot.bone_matrices {
            entry.bone_matrices = bones;
        }
        entry.generation = generation;
        entry.source = source;
        self.accepted.insert(instance, generation);
        true
    }

    pub fn entry(&self, instance: InstanceId) -> Option<&CacheEntry> {
        self.entries.get(&instance)
    }

    pub fn generation(&self, instance: InstanceId) -> Option<u64> {
        self.entries.get(&instance).map(|entry| entry.generation)
    }

    pub fn world_matrix(&self, instance: InstanceId, node: NodeIndex) -> AnimResult<Mat4> {
        let entry = self.entries.get(&instance).ok_or(AnimationError::InstanceNotFound(instance))?;
        entry.world_matrices.get(node as usize).copied().ok_or(AnimationError::NodeNotFound(node))
    }

    pub fn bone_matrices(&self, instance: InstanceId) -> &[Mat4] {
        self.entries.get(&instance).map(|entry| entry.bone_matrices.as_slice()).unwrap_or(&[])
    }

    pub fn bone_floats(&self, instance: InstanceId) -> &[f32] {
        matrices_as_floats(self.bone_matrices(instance))
    }

    /// Drops the cached pose but keeps the generation guard, so only newer
    /// evaluations can refill it.
    pub fn invalidate(&mut self, instance: InstanceId) -> bool {
        self.entries.remove(&instance).is_some()
    }

    /// Forgets `instance` for good; later publishes for it are rejected.
    pub fn remove_instance(&mut self, instance: InstanceId) {
        self.entries.remove(&instance);
        self.accepted.remove(&instance);
        self.issued.remove(&instance);
        self.dead.insert(instance);
    }

    pub fn is_dead(&self, instance: InstanceId) -> bool {
        self.dead.contains(&instance)
    }

    /// Forgets deleted ids that no in-flight request can still publish for.
    /// Callers must not reuse a pruned id. Returns how many were dropped.
    pub fn prune_dead(&mut self, mut in_flight: impl FnMut(InstanceId) -> bool) -> usize {
        let before = self.dead.len();
        self.dead.retain(|&instance| in_flight(instance));
        before - self.dead.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
