use crate::animation_validation::{AnimationValidationSeverity, AnimationValidator};
use crate::config::AnimationConfig;
use crate::error::{AnimResult, AnimationError};
use crate::pose::NodeTransform;
use crate::scene::{NodeIndex, NodeSeed, SceneGraph};
use anyhow::{anyhow, Result};
use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

pub mod skeletal;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipInterpolation {
    Step,
    Linear,
    CubicSpline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackChannel {
    Translation,
    Rotation,
    Scale,
}

impl TrackChannel {
    pub fn label(self) -> &'static str {
        match self {
            TrackChannel::Translation => "translation",
            TrackChannel::Rotation => "rotation",
            TrackChannel::Scale => "scale",
        }
    }
}

/// Keyframe payload. Cubic spline tracks store `[in_tangent, value, out_tangent]`
/// per keyframe, so they hold three entries for every time.
#[derive(Clone, Debug)]
pub enum TrackValues {
    Vec3(Arc<[Vec3]>),
    Quat(Arc<[Quat]>),
}

impl TrackValues {
    pub fn len(&self) -> usize {
        match self {
            TrackValues::Vec3(values) => values.len(),
            TrackValues::Quat(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct AnimationTrack {
    pub node: NodeIndex,
    pub channel: TrackChannel,
    pub interpolation: ClipInterpolation,
    pub times: Arc<[f32]>,
    pub values: TrackValues,
}

impl AnimationTrack {
    pub fn translation(
        node: NodeIndex,
        interpolation: ClipInterpolation,
        times: Vec<f32>,
        values: Vec<Vec3>,
    ) -> Self {
        Self {
            node,
            channel: TrackChannel::Translation,
            interpolation,
            times: Arc::from(times),
            values: TrackValues::Vec3(Arc::from(values)),
        }
    }

    pub fn rotation(node: NodeIndex, interpolation: ClipInterpolation, times: Vec<f32>, values: Vec<Quat>) -> Self {
        Self {
            node,
            channel: TrackChannel::Rotation,
            interpolation,
            times: Arc::from(times),
            values: TrackValues::Quat(Arc::from(values)),
        }
    }

    pub fn scale(node: NodeIndex, interpolation: ClipInterpolation, times: Vec<f32>, values: Vec<Vec3>) -> Self {
        Self {
            node,
            channel: TrackChannel::Scale,
            interpolation,
            times: Arc::from(times),
            values: TrackValues::Vec3(Arc::from(values)),
        }
    }

    pub fn end_time(&self) -> f32 {
        self.times.last().copied().unwrap_or(0.0)
    }

    /// Number of stored values one keyframe occupies.
    pub fn values_per_key(&self) -> usize {
        match self.interpolation {
            ClipInterpolation::CubicSpline => 3,
            ClipInterpolation::Step | ClipInterpolation::Linear => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnimationClip {
    pub name: Arc<str>,
    pub duration: f32,
    pub tracks: Arc<[AnimationTrack]>,
}

impl AnimationClip {
    /// Duration is the latest keyframe time across all tracks.
    pub fn new(name: impl Into<Arc<str>>, tracks: Vec<AnimationTrack>) -> Self {
        let duration = tracks.iter().map(AnimationTrack::end_time).fold(0.0_f32, f32::max);
        Self { name: name.into(), duration, tracks: Arc::from(tracks) }
    }
}

#[derive(Clone, Debug)]
pub struct ModelNode {
    pub name: Option<Arc<str>>,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub rest: NodeTransform,
    pub mesh: Option<u32>,
    pub skin: Option<u32>,
}

impl ModelNode {
    pub fn rest_local(&self) -> Mat4 {
        self.rest.to_matrix()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkinJoint {
    /// Position in the model's flat bone buffer.
    pub joint_index: u32,
    pub node: NodeIndex,
    pub inverse_bind: Mat4,
}

/// Slice of the flat bone buffer owned by one skin.
#[derive(Clone, Debug, PartialEq)]
pub struct SkinRange {
    pub name: Arc<str>,
    pub start: u32,
    pub len: u32,
}

/// Immutable per-model description shared by every instance and by the worker.
#[derive(Debug)]
pub struct ModelData {
    pub id: Arc<str>,
    nodes: Arc<[ModelNode]>,
    clips: HashMap<Arc<str>, Arc<AnimationClip>>,
    joints: Arc<[SkinJoint]>,
    skins: Arc<[SkinRange]>,
    node_names: HashMap<Arc<str>, NodeIndex>,
    rejected_clips: Vec<AnimationError>,
}

impl ModelData {
    pub fn nodes(&self) -> &[ModelNode] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn clip(&self, name: &str) -> Option<&Arc<AnimationClip>> {
        self.clips.get(name)
    }

    pub fn clip_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self.clips.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn joints(&self) -> &[SkinJoint] {
        &self.joints
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn skins(&self) -> &[SkinRange] {
        &self.skins
    }

    /// Clips dropped at load time because a track failed validation.
    pub fn rejected_clips(&self) -> &[AnimationError] {
        &self.rejected_clips
    }

    /// Display name of a node; unnamed nodes are called `node_<index>`.
    pub fn node_name(&self, index: NodeIndex) -> Option<Cow<'_, str>> {
        let node = self.nodes.get(index as usize)?;
        Some(match &node.name {
            Some(name) => Cow::Borrowed(name.as_ref()),
            None => Cow::Owned(format!("node_{index}")),
        })
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeIndex> {
        if let Some(index) = self.node_names.get(name) {
            return Some(*index);
        }
        let index: NodeIndex = name.strip_prefix("node_")?.parse().ok()?;
        let node = self.nodes.get(index as usize)?;
        node.name.is_none().then_some(index)
    }

    pub fn scene_seeds(&self) -> Vec<NodeSeed> {
        self.nodes
            .iter()
            .map(|node| NodeSeed { parent: node.parent, local: node.rest_local(), mesh: node.mesh, skin: node.skin })
            .collect()
    }
}

struct PendingSkin {
    name: Arc<str>,
    joints: Vec<(NodeIndex, Mat4)>,
}

/// Collects nodes, skins and clips, then validates them into a `ModelData`.
pub struct ModelBuilder {
    id: Arc<str>,
    nodes: Vec<ModelNode>,
    skins: Vec<PendingSkin>,
    clips: Vec<AnimationClip>,
    max_bones: usize,
}

impl ModelBuilder {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            skins: Vec::new(),
            clips: Vec::new(),
            max_bones: AnimationConfig::MAX_BONES,
        }
    }

    pub fn max_bones(mut self, max_bones: usize) -> Self {
        self.max_bones = max_bones;
        self
    }

    /// Appends a node. `parent` may reference a node added later.
    pub fn add_node(
        &mut self,
        name: Option<&str>,
        parent: Option<NodeIndex>,
        rest: NodeTransform,
        mesh: Option<u32>,
        skin: Option<u32>,
    ) -> NodeIndex {
        let index = self.nodes.len() as NodeIndex;
        self.nodes.push(ModelNode {
            name: name.map(Arc::from),
            parent,
            children: Vec::new(),
            rest,
            mesh,
            skin,
        });
        index
    }

    pub fn add_skin(&mut self, name: &str, joints: Vec<(NodeIndex, Mat4)>) -> u32 {
        let index = self.skins.len() as u32;
        self.skins.push(PendingSkin { name: Arc::from(name), joints });
        index
    }

    pub fn add_clip(&mut self, clip: AnimationClip) {
        self.clips.push(clip);
    }

    pub fn build(self) -> AnimResult<ModelData> {
        let ModelBuilder { id, mut nodes, skins, clips, max_bones } = self;
        let node_count = nodes.len();

        let seeds: Vec<NodeSeed> = nodes
            .iter()
            .map(|node| NodeSeed { parent: node.parent, local: Mat4::IDENTITY, mesh: node.mesh, skin: node.skin })
            .collect();
        let graph = SceneGraph::from_seeds(&seeds).map_err(|err| match err {
            AnimationError::InvalidParent(parent) => {
                AnimationError::MalformedModel(format!("model '{id}' references missing parent node {parent}"))
            }
            AnimationError::CycleDetected { node, .. } => {
                AnimationError::MalformedModel(format!("model '{id}' node {node} is its own parent"))
            }
            other => other,
        })?;
        for (index, node) in nodes.iter_mut().enumerate() {
            if let Some(scene_node) = graph.node(index as NodeIndex) {
                node.children = scene_node.children.clone();
            }
        }

        let mut joints: Vec<SkinJoint> = Vec::new();
        let mut ranges: Vec<SkinRange> = Vec::with_capacity(skins.len());
        for skin in skins {
            let start = joints.len() as u32;
            for (node, inverse_bind) in skin.joints {
                if node as usize >= node_count {
                    return Err(AnimationError::MalformedModel(format!(
                        "skin '{}' references missing joint node {node}",
                        skin.name
                    )));
                }
                if joints.len() >= max_bones {
                    log::warn!(
                        "[assets] model '{id}' exceeds {max_bones} bones; skin '{}' truncated",
                        skin.name
                    );
                    break;
                }
                joints.push(SkinJoint { joint_index: joints.len() as u32, node, inverse_bind });
            }
            ranges.push(SkinRange { name: skin.name, start, len: joints.len() as u32 - start });
        }

        let mut clip_map: HashMap<Arc<str>, Arc<AnimationClip>> = HashMap::new();
        let mut rejected_clips = Vec::new();
        for clip in clips {
            match AnimationValidator::validate_clip(&clip, node_count) {
                Ok(events) => {
                    for event in events {
                        match event.severity {
                            AnimationValidationSeverity::Info => log::debug!("[assets] {id}: {event}"),
                            _ => log::warn!("[assets] {id}: {event}"),
                        }
                    }
                    clip_map.insert(Arc::clone(&clip.name), Arc::new(clip));
                }
                Err(err) => {
                    log::warn!("[assets] model '{id}' clip rejected: {err}");
                    rejected_clips.push(err);
                }
            }
        }

        let node_names = nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.name.as_ref().map(|name| (Arc::clone(name), index as NodeIndex)))
            .collect();

        Ok(ModelData {
            id,
            nodes: Arc::from(nodes),
            clips: clip_map,
            joints: Arc::from(joints),
            skins: Arc::from(ranges),
            node_names,
            rejected_clips,
        })
    }
}

/// Reference-counted registry of loaded models keyed by model id.
#[derive(Default)]
pub struct AssetManager {
    models: HashMap<String, Arc<ModelData>>,
    model_sources: HashMap<String, String>,
    model_refs: HashMap<String, usize>,
    max_bones: usize,
}

impl AssetManager {
    pub fn new() -> Self {
        Self::with_max_bones(AnimationConfig::MAX_BONES)
    }

    pub fn with_max_bones(max_bones: usize) -> Self {
        Self { max_bones, ..Self::default() }
    }

    /// Registers an already built model. Model data is immutable once registered, so an
    /// id that is still loaded is rejected; release it fully before registering new data.
    pub fn insert_model(&mut self, model: ModelData) -> AnimResult<Arc<ModelData>> {
        let key = model.id.to_string();
        if self.models.contains_key(&key) {
            return Err(AnimationError::ModelAlreadyLoaded(key));
        }
        let model = Arc::new(model);
        self.models.insert(key.clone(), Arc::clone(&model));
        self.model_refs.insert(key, 1);
        Ok(model)
    }

    pub fn retain_model(&mut self, key: &str, gltf_path: Option<&str>) -> Result<Arc<ModelData>> {
        if let Some(model) = self.models.get(key) {
            let model = Arc::clone(model);
            *self.model_refs.entry(key.to_string()).or_insert(0) += 1;
            if let Some(path) = gltf_path {
                self.model_sources.insert(key.to_string(), path.to_string());
            }
            return Ok(model);
        }
        let path_owned = if let Some(path) = gltf_path {
            path.to_string()
        } else if let Some(stored) = self.model_sources.get(key) {
            stored.clone()
        } else {
            return Err(anyhow!("Model '{key}' is not loaded and no GLTF path provided to retain it."));
        };
        let model = Arc::new(skeletal::load_model_from_gltf(&path_owned, key, self.max_bones)?);
        self.models.insert(key.to_string(), Arc::clone(&model));
        self.model_sources.insert(key.to_string(), path_owned);
        self.model_refs.insert(key.to_string(), 1);
        Ok(model)
    }

    pub fn release_model(&mut self, key: &str) -> bool {
        if let Some(count) = self.model_refs.get_mut(key) {
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    self.model_refs.remove(key);
                    self.models.remove(key);
                }
                return true;
            }
        }
        false
    }

    pub fn model(&self, key: &str) -> Option<Arc<ModelData>> {
        self.models.get(key).cloned()
    }

    pub fn model_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.models.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn model_source(&self, key: &str) -> Option<&str> {
        self.model_sources.get(key).map(|s| s.as_str())
    }
}
