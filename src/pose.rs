use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Local translation/rotation/scale of a node, composed as T * R * S.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl NodeTransform {
    pub const IDENTITY: Self = Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY, scale: Vec3::ONE };

    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self { translation, rotation, scale }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

impl Default for NodeTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

bitflags! {
    /// Which pieces of a pose a consumer wants back.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PoseOutputs: u8 {
        const NODE_TRANSFORMS = 0b001;
        const WORLD_MATRICES = 0b010;
        const BONE_MATRICES = 0b100;
    }
}

impl PoseOutputs {
    pub fn with_bones(needs_bones: bool) -> Self {
        if needs_bones {
            Self::all()
        } else {
            Self::NODE_TRANSFORMS | Self::WORLD_MATRICES
        }
    }
}

impl Default for PoseOutputs {
    fn default() -> Self {
        Self::all()
    }
}

/// Owned copy of an evaluated pose, safe to move across threads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseSnapshot {
    pub node_transforms: Vec<NodeTransform>,
    pub world_matrices: Vec<Mat4>,
    pub bone_matrices: Option<Vec<Mat4>>,
}

impl PoseSnapshot {
    pub fn bone_floats(&self) -> &[f32] {
        match &self.bone_matrices {
            Some(bones) => matrices_as_floats(bones),
            None => &[],
        }
    }
}

/// Column-major float view of a matrix slice, 16 floats per matrix.
pub fn matrices_as_floats(matrices: &[Mat4]) -> &[f32] {
    bytemuck::cast_slice(matrices)
}
