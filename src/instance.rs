use crate::animation::{AnimationEvaluator, AnimationOptions, PlaybackSnapshot};
use crate::assets::{AssetManager, ModelData, SkinRange};
use crate::cache::{CacheEntry, PoseSource, ResultCache};
use crate::config::AnimationConfig;
use crate::error::{AnimResult, AnimationError};
use crate::pose::{NodeTransform, PoseOutputs};
use crate::scene::NodeIndex;
use crate::worker::{AnimationRequest, AnimationWorker};
use anyhow::Result;
use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ModelInstance {
    model: Arc<ModelData>,
    animation: AnimationEvaluator,
    placement: NodeTransform,
    disabled_nodes: HashSet<NodeIndex>,
}

impl ModelInstance {
    fn outputs(&self) -> PoseOutputs {
        PoseOutputs::with_bones(self.model.joint_count() > 0)
    }
}

/// Owns every animated instance, the shared result cache and the optional worker.
pub struct InstanceManager {
    config: AnimationConfig,
    assets: AssetManager,
    instances: HashMap<InstanceId, ModelInstance>,
    instances_by_model: HashMap<Arc<str>, Vec<InstanceId>>,
    cache: ResultCache,
    worker: Option<AnimationWorker>,
    use_worker: bool,
    next_instance_id: u32,
}

impl InstanceManager {
    pub fn new(config: AnimationConfig) -> Self {
        let mut manager = Self {
            assets: AssetManager::with_max_bones(config.max_bones),
            instances: HashMap::new(),
            instances_by_model: HashMap::new(),
            cache: ResultCache::new(),
            worker: None,
            use_worker: false,
            next_instance_id: 1,
            config,
        };
        if manager.config.use_worker {
            manager.set_use_worker(true);
        }
        manager
    }

    pub fn config(&self) -> &AnimationConfig {
        &self.config
    }

    pub fn assets(&self) -> &AssetManager {
        &self.assets
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Loads (or retains) a glTF model under `key`.
    pub fn load_model(&mut self, key: &str, gltf_path: Option<&str>) -> Result<Arc<ModelData>> {
        let model = self.assets.retain_model(key, gltf_path)?;
        self.ship_model(&model);
        Ok(model)
    }

    /// Registers a built model. Fails with `ModelAlreadyLoaded` if the id is taken.
    pub fn add_model(&mut self, model: ModelData) -> AnimResult<Arc<ModelData>> {
        let model = self.assets.insert_model(model)?;
        self.ship_model(&model);
        Ok(model)
    }

    pub fn model(&self, model_id: &str) -> AnimResult<Arc<ModelData>> {
        self.assets.model(model_id).ok_or_else(|| AnimationError::ModelNotFound(model_id.to_string()))
    }

    /// Creates an instance showing the bind pose, optionally starting `clip` right away.
    pub fn create_instance(&mut self, model_id: &str, clip: Option<&str>) -> AnimResult<InstanceId> {
        let model = self.model(model_id)?;
        let mut animation = AnimationEvaluator::new(Arc::clone(&model))?;
        if let Some(clip) = clip {
            animation.start(clip, AnimationOptions::default())?;
        }

        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        let mut instance =
            ModelInstance { model, animation, placement: NodeTransform::IDENTITY, disabled_nodes: HashSet::new() };
        Self::evaluate_inline(&mut self.cache, id, &mut instance)?;

        self.instances_by_model.entry(Arc::clone(&instance.model.id)).or_default().push(id);
        self.instances.insert(id, instance);
        log::debug!("[animation] created instance {id} of model '{model_id}'");
        Ok(id)
    }

    /// Removes the instance. Pending worker results for it are discarded on arrival.
    pub fn delete_instance(&mut self, id: InstanceId) -> AnimResult<()> {
        let instance = self.instances.remove(&id).ok_or(AnimationError::InstanceNotFound(id))?;
        if let Some(ids) = self.instances_by_model.get_mut(&instance.model.id) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.instances_by_model.remove(&instance.model.id);
            }
        }
        if let Some(worker) = self.worker.as_mut() {
            worker.release_instance(id);
        }
        self.cache.remove_instance(id);
        Ok(())
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instances_for_model(&self, model_id: &str) -> &[InstanceId] {
        self.instances_by_model.get(model_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn start_animation(&mut self, id: InstanceId, clip: &str, options: AnimationOptions) -> AnimResult<()> {
        self.instance_mut(id)?.animation.start(clip, options)
    }

    pub fn stop_animation(&mut self, id: InstanceId) -> AnimResult<()> {
        self.instance_mut(id)?.animation.stop()
    }

    pub fn set_bind_pose(&mut self, id: InstanceId) -> AnimResult<()> {
        self.instance_mut(id)?.animation.set_bind_pose()
    }

    pub fn pause_animation(&mut self, id: InstanceId) -> AnimResult<bool> {
        Ok(self.instance_mut(id)?.animation.pause())
    }

    pub fn resume_animation(&mut self, id: InstanceId) -> AnimResult<bool> {
        Ok(self.instance_mut(id)?.animation.resume())
    }

    pub fn set_animation_speed(&mut self, id: InstanceId, speed: f32) -> AnimResult<()> {
        self.instance_mut(id)?.animation.set_speed(speed);
        Ok(())
    }

    pub fn animation_speed(&self, id: InstanceId) -> AnimResult<f32> {
        Ok(self.instance(id)?.animation.speed())
    }

    pub fn is_playing(&self, id: InstanceId) -> AnimResult<bool> {
        Ok(self.instance(id)?.animation.playing())
    }

    pub fn elapsed_time(&self, id: InstanceId) -> AnimResult<f32> {
        Ok(self.instance(id)?.animation.elapsed())
    }

    pub fn playback_snapshot(&self, id: InstanceId) -> AnimResult<PlaybackSnapshot> {
        Ok(self.instance(id)?.animation.snapshot())
    }

    pub fn restore_playback(&mut self, id: InstanceId, snapshot: &PlaybackSnapshot) -> AnimResult<()> {
        self.instance_mut(id)?.animation.restore(snapshot)
    }

    /// Advances one instance and publishes its pose, either inline or via the worker.
    /// Returns true if a new pose was produced or requested.
    pub fn update_instance(&mut self, id: InstanceId, dt: f32) -> AnimResult<bool> {
        let instance = self.instances.get_mut(&id).ok_or(AnimationError::InstanceNotFound(id))?;
        instance.animation.advance(dt);
        if !instance.animation.needs_evaluation() {
            return Ok(false);
        }

        if self.use_worker {
            if let (Some(worker), Some(clip)) = (self.worker.as_mut(), instance.animation.clip_name()) {
                let request = AnimationRequest {
                    instance: id,
                    model_id: Arc::clone(&instance.model.id),
                    clip: Arc::clone(clip),
                    time: instance.animation.elapsed(),
                    looping: instance.animation.state().options.looping,
                    needs_bones: instance.model.joint_count() > 0,
                };
                match worker.request_animation(&mut self.cache, request, None) {
                    Ok(_) => {
                        instance.animation.mark_submitted();
                        return Ok(true);
                    }
                    Err(err) if err.is_worker_fallback() => {
                        if matches!(err, AnimationError::ModelNotReady(_)) {
                            if let Err(cache_err) = worker.cache_model(&instance.model) {
                                log::debug!(
                                    "[animation] could not ship model '{}' to worker: {cache_err}",
                                    instance.model.id
                                );
                            }
                        }
                        log::trace!("[animation] instance {id} evaluated inline: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Self::evaluate_inline(&mut self.cache, id, instance)?;
        Ok(true)
    }

    /// Delivers finished worker results, then updates every instance in id order.
    pub fn update_all(&mut self, dt: f32) -> usize {
        self.pump_worker();
        let mut ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        ids.sort_unstable();
        let mut updated = 0;
        for id in ids {
            match self.update_instance(id, dt) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(err) => log::warn!("[animation] instance {id} update failed: {err}"),
            }
        }
        updated
    }

    pub fn use_worker(&self) -> bool {
        self.use_worker
    }

    /// Switches between the worker and inline paths. In-flight worker results still
    /// land if they are newer than what the inline path published.
    pub fn set_use_worker(&mut self, enabled: bool) {
        self.use_worker = enabled;
        if !enabled {
            return;
        }
        if self.worker.is_none() {
            self.worker = Some(AnimationWorker::spawn(&self.config));
        }
        for key in self.assets.model_keys() {
            if let Some(model) = self.assets.model(&key) {
                self.ship_model(&model);
            }
        }
    }

    pub fn is_worker_ready(&self) -> bool {
        self.worker.as_ref().is_some_and(AnimationWorker::is_worker_ready)
    }

    pub fn is_model_ready_in_worker(&self, model_id: &str) -> bool {
        self.worker.as_ref().is_some_and(|worker| worker.is_model_ready(model_id))
    }

    pub fn cache_model_in_worker(&mut self, model_id: &str) -> AnimResult<()> {
        let model = self.model(model_id)?;
        let worker = self.worker.as_mut().ok_or(AnimationError::WorkerUnavailable)?;
        worker.cache_model(&model)
    }

    pub fn pump_worker(&mut self) -> usize {
        let published = match self.worker.as_mut() {
            Some(worker) => worker.pump(&mut self.cache),
            None => 0,
        };
        self.prune_deleted();
        published
    }

    pub fn flush_worker(&mut self, timeout: Duration) -> usize {
        let published = match self.worker.as_mut() {
            Some(worker) => worker.flush(&mut self.cache, timeout),
            None => 0,
        };
        self.prune_deleted();
        published
    }

    /// Instance ids are never reused, so a deleted id only needs its dead mark
    /// while the worker still tracks a request for it.
    fn prune_deleted(&mut self) {
        let worker = self.worker.as_ref();
        self.cache.prune_dead(|id| worker.is_some_and(|worker| worker.pending_request(id).is_some()));
    }

    pub fn worker_errors(&mut self) -> Vec<AnimationError> {
        self.worker.as_mut().map(AnimationWorker::take_errors).unwrap_or_default()
    }

    /// Stops the worker for good; instances keep animating inline.
    pub fn terminate_worker(&mut self) -> usize {
        self.worker.as_mut().map_or(0, AnimationWorker::terminate)
    }

    /// Drops the cached pose and forces a fresh evaluation on the next update.
    pub fn invalidate_animation_cache(&mut self, id: InstanceId) -> AnimResult<()> {
        self.instance_mut(id)?.animation.mark_dirty();
        self.cache.invalidate(id);
        Ok(())
    }

    pub fn mark_instance_dirty(&mut self, id: InstanceId) -> AnimResult<()> {
        self.instance_mut(id)?.animation.mark_dirty();
        Ok(())
    }

    pub fn cache_entry(&self, id: InstanceId) -> Option<&CacheEntry> {
        self.cache.entry(id)
    }

    pub fn world_matrix(&self, id: InstanceId, node: NodeIndex) -> AnimResult<Mat4> {
        self.cache.world_matrix(id, node)
    }

    pub fn bone_matrices(&self, id: InstanceId) -> &[Mat4] {
        self.cache.bone_matrices(id)
    }

    pub fn bone_floats(&self, id: InstanceId) -> &[f32] {
        self.cache.bone_floats(id)
    }

    pub fn skin_ranges(&self, id: InstanceId) -> AnimResult<&[SkinRange]> {
        Ok(self.instance(id)?.model.skins())
    }

    /// Returns false when the model has no node called `name`.
    pub fn enable_node(&mut self, id: InstanceId, name: &str) -> AnimResult<bool> {
        let instance = self.instance_mut(id)?;
        let Some(node) = instance.model.node_by_name(name) else {
            return Ok(false);
        };
        instance.disabled_nodes.remove(&node);
        Ok(true)
    }

    pub fn disable_node(&mut self, id: InstanceId, name: &str) -> AnimResult<bool> {
        let instance = self.instance_mut(id)?;
        let Some(node) = instance.model.node_by_name(name) else {
            return Ok(false);
        };
        instance.disabled_nodes.insert(node);
        Ok(true)
    }

    pub fn enable_all_nodes(&mut self, id: InstanceId) -> AnimResult<()> {
        self.instance_mut(id)?.disabled_nodes.clear();
        Ok(())
    }

    pub fn disable_all_nodes(&mut self, id: InstanceId) -> AnimResult<()> {
        let instance = self.instance_mut(id)?;
        instance.disabled_nodes = (0..instance.model.node_count() as NodeIndex).collect();
        Ok(())
    }

    /// Unknown node names report false.
    pub fn is_node_enabled(&self, id: InstanceId, name: &str) -> AnimResult<bool> {
        let instance = self.instance(id)?;
        Ok(instance.model.node_by_name(name).is_some_and(|node| !instance.disabled_nodes.contains(&node)))
    }

    pub fn set_position(&mut self, id: InstanceId, position: Vec3) -> AnimResult<()> {
        self.instance_mut(id)?.placement.translation = position;
        Ok(())
    }

    pub fn set_rotation(&mut self, id: InstanceId, rotation: Quat) -> AnimResult<()> {
        self.instance_mut(id)?.placement.rotation = rotation;
        Ok(())
    }

    pub fn set_scale(&mut self, id: InstanceId, scale: Vec3) -> AnimResult<()> {
        self.instance_mut(id)?.placement.scale = scale;
        Ok(())
    }

    pub fn placement(&self, id: InstanceId) -> AnimResult<NodeTransform> {
        Ok(self.instance(id)?.placement)
    }

    /// Instance placement as T·R·S; node world matrices are relative to this.
    pub fn instance_world_matrix(&self, id: InstanceId) -> AnimResult<Mat4> {
        Ok(self.instance(id)?.placement.to_matrix())
    }

    fn instance(&self, id: InstanceId) -> AnimResult<&ModelInstance> {
        self.instances.get(&id).ok_or(AnimationError::InstanceNotFound(id))
    }

    fn instance_mut(&mut self, id: InstanceId) -> AnimResult<&mut ModelInstance> {
        self.instances.get_mut(&id).ok_or(AnimationError::InstanceNotFound(id))
    }

    fn ship_model(&mut self, model: &Arc<ModelData>) {
        if !self.use_worker {
            return;
        }
        if let Some(worker) = self.worker.as_mut() {
            if let Err(err) = worker.cache_model(model) {
                log::warn!("[animation] could not cache model '{}' on worker: {err}", model.id);
            }
        }
    }

    fn evaluate_inline(cache: &mut ResultCache, id: InstanceId, instance: &mut ModelInstance) -> AnimResult<()> {
        let outputs = instance.outputs();
        instance.animation.evaluate(outputs)?;
        let generation = cache.reserve_generation(id);
        cache.publish_pose(id, generation, instance.animation.pose(), outputs, PoseSource::Inline);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AnimationClip, AnimationTrack, ClipInterpolation, ModelBuilder};

    fn manager_with_rig() -> InstanceManager {
        let mut builder = ModelBuilder::new("rig");
        let root = builder.add_node(Some("root"), None, NodeTransform::IDENTITY, Some(0), Some(0));
        builder.add_node(None, Some(root), NodeTransform::IDENTITY, None, None);
        builder.add_skin("body", vec![(0, Mat4::IDENTITY), (1, Mat4::IDENTITY)]);
        builder.add_clip(AnimationClip::new(
            "walk",
            vec![AnimationTrack::translation(0, ClipInterpolation::Linear, vec![0.0, 1.0], vec![Vec3::ZERO, Vec3::X])],
        ));
        let mut manager = InstanceManager::new(AnimationConfig::default());
        manager.add_model(builder.build().expect("build rig")).expect("add rig");
        manager
    }

    #[test]
    fn new_instance_publishes_bind_pose() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", None).expect("instance");
        assert_eq!(manager.bone_matrices(id).len(), 2);
        assert_eq!(manager.bone_floats(id).len(), 32);
        assert_eq!(manager.cache_entry(id).expect("entry").source, PoseSource::Inline);
        assert_eq!(manager.instances_for_model("rig"), &[id]);
    }

    #[test]
    fn unknown_model_and_clip_fail() {
        let mut manager = manager_with_rig();
        assert_eq!(manager.create_instance("ghost", None), Err(AnimationError::ModelNotFound("ghost".to_string())));
        assert!(matches!(manager.create_instance("rig", Some("fly")), Err(AnimationError::AnimationNotFound { .. })));
        assert_eq!(manager.instance_count(), 0);
    }

    #[test]
    fn update_moves_animated_node() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", Some("walk")).expect("instance");
        assert!(manager.update_instance(id, 0.25).expect("update"));
        let world = manager.world_matrix(id, 0).expect("world");
        assert!((world.w_axis.x - 0.25).abs() < 1e-6);
        manager.pause_animation(id).expect("pause");
        assert!(!manager.update_instance(id, 0.25).expect("paused update"));
    }

    #[test]
    fn deleted_instance_is_gone_everywhere() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", Some("walk")).expect("instance");
        manager.delete_instance(id).expect("delete");
        assert!(manager.cache_entry(id).is_none());
        assert!(manager.instances_for_model("rig").is_empty());
        assert_eq!(manager.update_instance(id, 0.1), Err(AnimationError::InstanceNotFound(id)));
        assert_eq!(manager.delete_instance(id), Err(AnimationError::InstanceNotFound(id)));
    }

    #[test]
    fn deleted_ids_are_pruned_once_nothing_is_in_flight() {
        let mut manager = manager_with_rig();
        let ids: Vec<InstanceId> =
            (0..3).map(|_| manager.create_instance("rig", Some("walk")).expect("instance")).collect();
        for &id in &ids {
            manager.delete_instance(id).expect("delete");
            assert!(manager.cache().is_dead(id));
        }
        assert_eq!(manager.update_all(0.1), 0);
        assert!(ids.iter().all(|&id| !manager.cache().is_dead(id)));

        let fresh = manager.create_instance("rig", None).expect("instance");
        assert!(ids.iter().all(|&id| id != fresh));
    }

    #[test]
    fn node_visibility_by_name() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", None).expect("instance");
        assert!(manager.is_node_enabled(id, "root").expect("query"));
        assert!(manager.disable_node(id, "node_1").expect("disable"));
        assert!(!manager.is_node_enabled(id, "node_1").expect("query"));
        assert!(!manager.disable_node(id, "missing").expect("unknown node"));
        manager.disable_all_nodes(id).expect("disable all");
        assert!(!manager.is_node_enabled(id, "root").expect("query"));
        manager.enable_all_nodes(id).expect("enable all");
        assert!(manager.is_node_enabled(id, "node_1").expect("query"));
    }

    #[test]
    fn placement_composes_trs() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", None).expect("instance");
        manager.set_position(id, Vec3::new(1.0, 2.0, 3.0)).expect("position");
        manager.set_scale(id, Vec3::splat(2.0)).expect("scale");
        let matrix = manager.instance_world_matrix(id).expect("matrix");
        assert_eq!(matrix.transform_point3(Vec3::X), Vec3::new(3.0, 2.0, 3.0));
    }

    #[test]
    fn invalidate_forces_reevaluation() {
        let mut manager = manager_with_rig();
        let id = manager.create_instance("rig", None).expect("instance");
        assert!(!manager.update_instance(id, 0.1).expect("idle"));
        manager.invalidate_animation_cache(id).expect("invalidate");
        assert!(manager.cache_entry(id).is_none());
        assert!(manager.update_instance(id, 0.0).expect("refresh"));
        assert!(manager.cache_entry(id).is_some());
    }
}
