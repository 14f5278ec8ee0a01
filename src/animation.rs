use crate::assets::{AnimationClip, ModelData, TrackChannel};
use crate::error::{AnimResult, AnimationError};
use crate::pose::{NodeTransform, PoseOutputs, PoseSnapshot};
use crate::sampler::{self, SampledValue};
use crate::scene::{NodeIndex, SceneGraph};
use anyhow::{Context, Result};
use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maps an unbounded playback time onto the clip timeline. NaN maps to the start,
/// and so does an infinite time on a looping clip.
pub fn clip_time(duration: f32, time: f32, looping: bool) -> f32 {
    if duration <= 0.0 || time.is_nan() {
        return 0.0;
    }
    if looping {
        if time.is_infinite() {
            return 0.0;
        }
        time.rem_euclid(duration.max(f32::EPSILON))
    } else {
        time.clamp(0.0, duration)
    }
}

/// Sample, propagate and skin for one model. Both the inline path and the worker
/// thread run this same kernel, so their poses match bit for bit.
#[derive(Clone, Debug)]
pub struct PoseEvaluator {
    model: Arc<ModelData>,
    graph: SceneGraph,
    transforms: Vec<NodeTransform>,
    scratch: Vec<NodeTransform>,
    world: Vec<Mat4>,
    bones: Vec<Mat4>,
}

impl PoseEvaluator {
    pub fn new(model: Arc<ModelData>) -> AnimResult<Self> {
        let graph = SceneGraph::from_seeds(&model.scene_seeds())?;
        let transforms: Vec<NodeTransform> = model.nodes().iter().map(|node| node.rest).collect();
        let mut evaluator = Self {
            scratch: Vec::with_capacity(transforms.len()),
            world: Vec::with_capacity(transforms.len()),
            bones: Vec::with_capacity(model.joint_count()),
            model,
            graph,
            transforms,
        };
        evaluator.update_world_matrices();
        evaluator.derive_bone_matrices();
        Ok(evaluator)
    }

    pub fn model(&self) -> &Arc<ModelData> {
        &self.model
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    /// Writes every node's rest transform back into the graph.
    pub fn apply_bind_pose(&mut self) -> AnimResult<()> {
        self.scratch.clear();
        self.scratch.extend(self.model.nodes().iter().map(|node| node.rest));
        self.commit_scratch()
    }

    /// Samples `clip` at clip-local `time` on top of the rest pose and stores the
    /// resulting local matrices. Only nodes whose transform changed are dirtied.
    pub fn sample(&mut self, clip: &AnimationClip, time: f32) -> AnimResult<()> {
        self.scratch.clear();
        self.scratch.extend(self.model.nodes().iter().map(|node| node.rest));

        for (track_index, track) in clip.tracks.iter().enumerate() {
            let malformed = |reason: String| AnimationError::MalformedTrack {
                clip: Arc::clone(&clip.name),
                track: track_index,
                reason,
            };
            let value = sampler::sample_track(track, time).map_err(|err| malformed(err.to_string()))?;
            let Some(target) = self.scratch.get_mut(track.node as usize) else {
                return Err(malformed(format!("targets missing node {}", track.node)));
            };
            match (track.channel, value) {
                (TrackChannel::Translation, SampledValue::Vec3(v)) => target.translation = v,
                (TrackChannel::Scale, SampledValue::Vec3(v)) => target.scale = v,
                (TrackChannel::Rotation, SampledValue::Quat(q)) => target.rotation = q,
                (channel, _) => {
                    return Err(malformed(format!("{} channel holds the wrong value type", channel.label())));
                }
            }
        }
        self.commit_scratch()
    }

    pub fn update_world_matrices(&mut self) -> usize {
        let updated = self.graph.update_world_matrices();
        if updated > 0 || self.world.len() != self.graph.len() {
            self.graph.copy_world_matrices(&mut self.world);
        }
        updated
    }

    /// `world[joint.node] * inverse_bind` for every joint, in joint order. The
    /// buffer is reused across frames.
    pub fn derive_bone_matrices(&mut self) -> &[Mat4] {
        self.bones.clear();
        let world = &self.world;
        self.bones.extend(self.model.joints().iter().map(|joint| {
            let node_world = world.get(joint.node as usize).copied().unwrap_or(Mat4::IDENTITY);
            node_world * joint.inverse_bind
        }));
        &self.bones
    }

    /// Full pipeline for one frame. `clip == None` evaluates the bind pose.
    pub fn evaluate(
        &mut self,
        clip: Option<&AnimationClip>,
        time: f32,
        looping: bool,
        outputs: PoseOutputs,
    ) -> AnimResult<()> {
        match clip {
            Some(clip) => self.sample(clip, clip_time(clip.duration, time, looping))?,
            None => self.apply_bind_pose()?,
        }
        self.update_world_matrices();
        if outputs.contains(PoseOutputs::BONE_MATRICES) {
            self.derive_bone_matrices();
        }
        Ok(())
    }

    pub fn node_transforms(&self) -> &[NodeTransform] {
        &self.transforms
    }

    pub fn world_matrices(&self) -> &[Mat4] {
        &self.world
    }

    pub fn world_matrix(&self, node: NodeIndex) -> AnimResult<Mat4> {
        self.world.get(node as usize).copied().ok_or(AnimationError::NodeNotFound(node))
    }

    pub fn bone_matrices(&self) -> &[Mat4] {
        &self.bones
    }

    pub fn snapshot(&self, outputs: PoseOutputs) -> PoseSnapshot {
        PoseSnapshot {
            node_transforms: if outputs.contains(PoseOutputs::NODE_TRANSFORMS) {
                self.transforms.clone()
            } else {
                Vec::new()
            },
            world_matrices: if outputs.contains(PoseOutputs::WORLD_MATRICES) {
                self.world.clone()
            } else {
                Vec::new()
            },
            bone_matrices: outputs.contains(PoseOutputs::BONE_MATRICES).then(|| self.bones.clone()),
        }
    }

    fn commit_scratch(&mut self) -> AnimResult<()> {
        for (index, (current, next)) in self.transforms.iter_mut().zip(self.scratch.iter()).enumerate() {
            if current != next {
                *current = *next;
                self.graph.set_local_matrix(index as NodeIndex, next.to_matrix())?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    /// Non-looping clip reached its end and holds the last pose.
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimationOptions {
    pub looping: bool,
    pub speed: f32,
    /// Stored for callers; only one clip is ever active so nothing blends.
    pub blend_duration: f32,
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self { looping: true, speed: 1.0, blend_duration: 0.0 }
    }
}

#[derive(Clone, Debug)]
pub struct AnimationState {
    pub clip: Option<Arc<AnimationClip>>,
    pub playback: PlaybackState,
    pub options: AnimationOptions,
    pub elapsed: f32,
}

impl Default for AnimationState {
    fn default() -> Self {
        Self { clip: None, playback: PlaybackState::Stopped, options: AnimationOptions::default(), elapsed: 0.0 }
    }
}

/// Serializable playback position used to resume an instance later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub clip: Option<String>,
    pub time: f32,
    pub options: AnimationOptions,
    pub playback: PlaybackState,
}

impl PlaybackSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to encode playback snapshot")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("Failed to decode playback snapshot")
    }
}

/// Per-instance playback state machine driving a `PoseEvaluator`.
pub struct AnimationEvaluator {
    state: AnimationState,
    pose: PoseEvaluator,
    pose_dirty: bool,
}

impl AnimationEvaluator {
    pub fn new(model: Arc<ModelData>) -> AnimResult<Self> {
        Ok(Self { state: AnimationState::default(), pose: PoseEvaluator::new(model)?, pose_dirty: true })
    }

    pub fn model(&self) -> &Arc<ModelData> {
        self.pose.model()
    }

    pub fn state(&self) -> &AnimationState {
        &self.state
    }

    pub fn pose(&self) -> &PoseEvaluator {
        &self.pose
    }

    pub fn playing(&self) -> bool {
        self.state.playback == PlaybackState::Playing
    }

    pub fn elapsed(&self) -> f32 {
        self.state.elapsed
    }

    pub fn clip_name(&self) -> Option<&Arc<str>> {
        self.state.clip.as_ref().map(|clip| &clip.name)
    }

    /// Starts `clip` from time zero. Unknown clips leave the current state untouched.
    pub fn start(&mut self, clip: &str, options: AnimationOptions) -> AnimResult<()> {
        let model = self.pose.model();
        let found = model.clip(clip).cloned().ok_or_else(|| AnimationError::AnimationNotFound {
            model: Arc::clone(&model.id),
            clip: clip.to_string(),
        })?;
        self.state = AnimationState { clip: Some(found), playback: PlaybackState::Playing, options, elapsed: 0.0 };
        self.pose_dirty = true;
        Ok(())
    }

    pub fn stop(&mut self) -> AnimResult<()> {
        self.set_bind_pose()
    }

    /// Drops the active clip and restores every node's rest transform.
    pub fn set_bind_pose(&mut self) -> AnimResult<()> {
        self.state.clip = None;
        self.state.playback = PlaybackState::Stopped;
        self.state.elapsed = 0.0;
        self.pose.apply_bind_pose()?;
        self.pose_dirty = true;
        Ok(())
    }

    pub fn pause(&mut self) -> bool {
        if self.state.playback == PlaybackState::Playing {
            self.state.playback = PlaybackState::Paused;
            true
        } else {
            false
        }
    }

    pub fn resume(&mut self) -> bool {
        if self.state.playback == PlaybackState::Paused {
            self.state.playback = PlaybackState::Playing;
            true
        } else {
            false
        }
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.state.options.speed = speed;
    }

    pub fn speed(&self) -> f32 {
        self.state.options.speed
    }

    /// Moves playback forward by `dt * speed`. Returns true if the time changed.
    pub fn advance(&mut self, dt: f32) -> bool {
        if self.state.playback != PlaybackState::Playing {
            return false;
        }
        let Some(clip) = self.state.clip.as_ref() else {
            return false;
        };
        let step = dt * self.state.options.speed;
        if !step.is_finite() {
            log::warn!("[animation] ignoring non-finite time step {dt} at speed {}", self.state.options.speed);
            return false;
        }
        let duration = clip.duration;
        let previous = self.state.elapsed;
        let raw = previous + step;
        if self.state.options.looping {
            self.state.elapsed = clip_time(duration, raw, true);
        } else if raw >= duration {
            self.state.elapsed = duration;
            self.state.playback = PlaybackState::Finished;
        } else {
            self.state.elapsed = raw.max(0.0);
        }
        let changed = self.state.elapsed != previous;
        self.pose_dirty |= changed;
        changed
    }

    /// Samples the active clip into local transforms without propagating.
    pub fn sample(&mut self) -> AnimResult<()> {
        match self.state.clip.as_ref() {
            Some(clip) => self.pose.sample(clip, self.state.elapsed),
            None => Ok(()),
        }
    }

    pub fn update_world_matrices(&mut self) -> usize {
        self.pose.update_world_matrices()
    }

    pub fn derive_bone_matrices(&mut self) -> &[Mat4] {
        self.pose.derive_bone_matrices()
    }

    pub fn evaluate(&mut self, outputs: PoseOutputs) -> AnimResult<()> {
        let clip = self.state.clip.clone();
        self.pose.evaluate(clip.as_deref(), self.state.elapsed, self.state.options.looping, outputs)?;
        self.pose_dirty = false;
        Ok(())
    }

    /// Advances and re-evaluates if anything changed. Returns true if a new pose was produced.
    pub fn update(&mut self, dt: f32, outputs: PoseOutputs) -> AnimResult<bool> {
        self.advance(dt);
        if !self.pose_dirty {
            return Ok(false);
        }
        self.evaluate(outputs)?;
        Ok(true)
    }

    pub fn needs_evaluation(&self) -> bool {
        self.pose_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.pose_dirty = true;
    }

    /// The pose for the current time was handed to another evaluator.
    pub fn mark_submitted(&mut self) {
        self.pose_dirty = false;
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            clip: self.clip_name().map(|name| name.to_string()),
            time: self.state.elapsed,
            options: self.state.options,
            playback: self.state.playback,
        }
    }

    pub fn restore(&mut self, snapshot: &PlaybackSnapshot) -> AnimResult<()> {
        match snapshot.clip.as_deref() {
            Some(clip) => {
                self.start(clip, snapshot.options)?;
                let duration = self.state.clip.as_ref().map_or(0.0, |clip| clip.duration);
                self.state.elapsed = clip_time(duration, snapshot.time, snapshot.options.looping);
                self.state.playback = snapshot.playback;
            }
            None => {
                self.set_bind_pose()?;
                self.state.options = snapshot.options;
            }
        }
        self.pose_dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AnimationTrack, ClipInterpolation, ModelBuilder};
    use glam::{Quat, Vec3};

    fn rig() -> Arc<ModelData> {
        let mut builder = ModelBuilder::new("rig");
        let root = builder.add_node(Some("root"), None, NodeTransform::IDENTITY, None, None);
        builder.add_node(
            Some("tip"),
            Some(root),
            NodeTransform { translation: Vec3::Y, ..NodeTransform::IDENTITY },
            None,
            None,
        );
        builder.add_skin("body", vec![(0, Mat4::IDENTITY), (1, Mat4::from_translation(-Vec3::Y))]);
        builder.add_clip(AnimationClip::new(
            "slide",
            vec![AnimationTrack::translation(
                0,
                ClipInterpolation::Linear,
                vec![0.0, 2.0],
                vec![Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0)],
            )],
        ));
        builder.add_clip(AnimationClip::new(
            "spin",
            vec![AnimationTrack::rotation(
                1,
                ClipInterpolation::Step,
                vec![0.0, 1.0],
                vec![Quat::IDENTITY, Quat::from_rotation_z(1.0)],
            )],
        ));
        Arc::new(builder.build().expect("build rig"))
    }

    fn evaluator() -> AnimationEvaluator {
        AnimationEvaluator::new(rig()).expect("evaluator")
    }

    fn no_loop() -> AnimationOptions {
        AnimationOptions { looping: false, ..AnimationOptions::default() }
    }

    #[test]
    fn clip_time_wraps_or_clamps() {
        assert!((clip_time(2.0, 2.5, true) - 0.5).abs() < 1e-6);
        assert!((clip_time(2.0, -0.5, true) - 1.5).abs() < 1e-6);
        assert_eq!(clip_time(2.0, 2.5, false), 2.0);
        assert_eq!(clip_time(0.0, 3.0, true), 0.0);
        assert_eq!(clip_time(2.0, f32::NAN, true), 0.0);
        assert_eq!(clip_time(2.0, f32::NAN, false), 0.0);
        assert_eq!(clip_time(2.0, f32::INFINITY, true), 0.0);
        assert_eq!(clip_time(2.0, f32::INFINITY, false), 2.0);
    }

    #[test]
    fn non_finite_steps_are_ignored() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        anim.advance(0.5);
        assert!(!anim.advance(f32::INFINITY));
        assert!(!anim.advance(f32::NAN));
        assert!((anim.elapsed() - 0.5).abs() < 1e-6);
        assert!(anim.playing());

        anim.set_speed(f32::INFINITY);
        assert!(!anim.advance(0.1));
        assert!((anim.elapsed() - 0.5).abs() < 1e-6);
        anim.evaluate(PoseOutputs::all()).expect("evaluate");
    }

    #[test]
    fn looping_advance_wraps_elapsed_time() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        anim.advance(2.5);
        assert!((anim.elapsed() - 0.5).abs() < 1e-6);
        assert!(anim.playing());
    }

    #[test]
    fn non_looping_advance_clamps_and_stops() {
        let mut anim = evaluator();
        anim.start("slide", no_loop()).expect("start");
        anim.advance(2.5);
        assert_eq!(anim.elapsed(), 2.0);
        assert!(!anim.playing());
        assert_eq!(anim.state().playback, PlaybackState::Finished);
        assert!(anim.clip_name().is_some());
        assert!(!anim.advance(1.0));
    }

    #[test]
    fn unknown_clip_keeps_previous_state() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        anim.advance(0.75);
        let err = anim.start("jump", AnimationOptions::default()).unwrap_err();
        assert!(matches!(err, AnimationError::AnimationNotFound { ref clip, .. } if clip == "jump"));
        assert_eq!(anim.clip_name().map(|name| name.as_ref()), Some("slide"));
        assert!((anim.elapsed() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn paused_playback_does_not_advance() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        assert!(anim.pause());
        assert!(!anim.advance(1.0));
        assert_eq!(anim.elapsed(), 0.0);
        assert!(anim.resume());
        anim.advance(1.0);
        assert_eq!(anim.elapsed(), 1.0);
    }

    #[test]
    fn speed_scales_advance() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions { speed: 0.5, ..AnimationOptions::default() }).expect("start");
        anim.advance(1.0);
        assert_eq!(anim.elapsed(), 0.5);
        anim.set_speed(2.0);
        anim.advance(0.25);
        assert_eq!(anim.elapsed(), 1.0);
    }

    #[test]
    fn bone_matrices_follow_animated_parent() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        assert!(anim.update(1.0, PoseOutputs::all()).expect("update"));
        let bones = anim.pose().bone_matrices();
        assert_eq!(bones.len(), 2);
        assert!((bones[0].w_axis.truncate() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
        // tip sits at (1, 1, 0) in world space; its inverse bind cancels the rest offset.
        assert!((bones[1].w_axis.truncate() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
        assert!(!anim.update(0.0, PoseOutputs::all()).expect("idle update"));
    }

    #[test]
    fn stop_restores_bind_pose() {
        let mut anim = evaluator();
        anim.start("spin", no_loop()).expect("start");
        anim.update(1.5, PoseOutputs::all()).expect("update");
        assert_ne!(anim.pose().node_transforms()[1].rotation, Quat::IDENTITY);
        anim.stop().expect("stop");
        anim.evaluate(PoseOutputs::all()).expect("evaluate");
        assert_eq!(anim.pose().node_transforms()[1], rig().nodes()[1].rest);
        assert_eq!(anim.state().playback, PlaybackState::Stopped);
        for bone in anim.pose().bone_matrices() {
            assert!(bone.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
    }

    #[test]
    fn snapshot_restores_playback_position() {
        let mut anim = evaluator();
        anim.start("slide", no_loop()).expect("start");
        anim.advance(1.25);
        let bytes = anim.snapshot().to_bytes().expect("encode");

        let mut resumed = evaluator();
        resumed.restore(&PlaybackSnapshot::from_bytes(&bytes).expect("decode")).expect("restore");
        assert_eq!(resumed.elapsed(), 1.25);
        assert!(resumed.playing());
        assert!(!resumed.state().options.looping);
    }

    #[test]
    fn outputs_without_bones_leave_snapshot_bones_empty() {
        let mut anim = evaluator();
        anim.start("slide", AnimationOptions::default()).expect("start");
        anim.evaluate(PoseOutputs::with_bones(false)).expect("evaluate");
        let snapshot = anim.pose().snapshot(PoseOutputs::with_bones(false));
        assert!(snapshot.bone_matrices.is_none());
        assert_eq!(snapshot.world_matrices.len(), 2);
    }
}
