use super::{AnimationClip, AnimationTrack, ClipInterpolation, ModelBuilder, ModelData};
use crate::pose::NodeTransform;
use crate::scene::NodeIndex;
use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3};
use gltf::animation::util::{ReadOutputs, Rotations};
use gltf::animation::{Interpolation, Property};
use std::collections::HashMap;
use std::path::Path;

pub fn load_model_from_gltf(path: impl AsRef<Path>, key: &str, max_bones: usize) -> Result<ModelData> {
    let path_ref = path.as_ref();
    let (document, buffers, _) = gltf::import(path_ref)
        .with_context(|| format!("Failed to import GLTF model from {}", path_ref.display()))?;
    build_model_from_document(&document, &buffers, key, max_bones)
        .with_context(|| format!("Failed to build model '{key}' from {}", path_ref.display()))
}

/// Converts a parsed glTF document into model data: every node, every skin
/// (concatenated into one bone buffer) and every animation.
pub fn build_model_from_document(
    document: &gltf::Document,
    buffers: &[gltf::buffer::Data],
    key: &str,
    max_bones: usize,
) -> Result<ModelData> {
    let mut parent_of_node: HashMap<usize, usize> = HashMap::new();
    for node in document.nodes() {
        for child in node.children() {
            parent_of_node.insert(child.index(), node.index());
        }
    }

    let mut builder = ModelBuilder::new(key).max_bones(max_bones);
    for node in document.nodes() {
        let (t, r, s) = node.transform().decomposed();
        let rotation = Quat::from_xyzw(r[0], r[1], r[2], r[3]);
        let rest = NodeTransform {
            translation: Vec3::from_array(t),
            rotation: if rotation.length_squared() > 0.0 { rotation.normalize() } else { Quat::IDENTITY },
            scale: Vec3::from_array(s),
        };
        builder.add_node(
            node.name(),
            parent_of_node.get(&node.index()).map(|&parent| parent as NodeIndex),
            rest,
            node.mesh().map(|mesh| mesh.index() as u32),
            node.skin().map(|skin| skin.index() as u32),
        );
    }

    for skin in document.skins() {
        let reader = skin.reader(|buffer| Some(&buffers[buffer.index()]));
        let mut joints: Vec<(NodeIndex, Mat4)> =
            skin.joints().map(|joint| (joint.index() as NodeIndex, Mat4::IDENTITY)).collect();
        if let Some(inverse_binds) = reader.read_inverse_bind_matrices() {
            for (slot, matrix) in joints.iter_mut().zip(inverse_binds) {
                slot.1 = Mat4::from_cols_array_2d(&matrix);
            }
        }
        let name = skin.name().map(str::to_string).unwrap_or_else(|| format!("skin_{}", skin.index()));
        builder.add_skin(&name, joints);
    }

    for (anim_index, animation) in document.animations().enumerate() {
        let clip_name = animation.name().map(str::to_string).unwrap_or_else(|| format!("animation_{anim_index}"));
        let mut tracks: Vec<AnimationTrack> = Vec::new();

        for channel in animation.channels() {
            let target = channel.target().node().index() as NodeIndex;
            let interpolation = match channel.sampler().interpolation() {
                Interpolation::Step => ClipInterpolation::Step,
                Interpolation::Linear => ClipInterpolation::Linear,
                Interpolation::CubicSpline => ClipInterpolation::CubicSpline,
            };

            let reader = channel.reader(|buffer| Some(&buffers[buffer.index()]));
            let Some(inputs) = reader.read_inputs() else {
                continue;
            };
            let times: Vec<f32> = inputs.collect();
            let Some(outputs) = reader.read_outputs() else {
                continue;
            };

            match (channel.target().property(), outputs) {
                (Property::Translation, ReadOutputs::Translations(values)) => {
                    let values = values.map(Vec3::from_array).collect();
                    tracks.push(AnimationTrack::translation(target, interpolation, times, values));
                }
                (Property::Scale, ReadOutputs::Scales(values)) => {
                    let values = values.map(Vec3::from_array).collect();
                    tracks.push(AnimationTrack::scale(target, interpolation, times, values));
                }
                (Property::Rotation, ReadOutputs::Rotations(rotations)) => {
                    let values = convert_rotations(rotations, interpolation);
                    tracks.push(AnimationTrack::rotation(target, interpolation, times, values));
                }
                (Property::MorphTargetWeights, _) => {
                    log::debug!("[assets] animation '{clip_name}' morph weights on node {target} ignored");
                }
                _ => {
                    log::warn!("[assets] animation '{clip_name}' channel on node {target} has mismatched output type");
                }
            }
        }

        if tracks.is_empty() {
            continue;
        }
        builder.add_clip(AnimationClip::new(clip_name, tracks));
    }

    Ok(builder.build()?)
}

/// Cubic spline tangents are not unit quaternions and must stay untouched.
fn convert_rotations(rotations: Rotations, interpolation: ClipInterpolation) -> Vec<Quat> {
    let normalize = interpolation != ClipInterpolation::CubicSpline;
    rotations
        .into_f32()
        .map(|components| {
            let quat = Quat::from_array(components);
            if !normalize {
                quat
            } else if quat.length_squared() > 0.0 {
                quat.normalize()
            } else {
                Quat::IDENTITY
            }
        })
        .collect()
}
