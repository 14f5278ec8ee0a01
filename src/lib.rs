pub mod animation;
pub mod animation_validation;
pub mod assets;
pub mod cache;
pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod pose;
pub mod sampler;
pub mod scene;
pub mod worker;

pub use animation::{AnimationEvaluator, AnimationOptions, PlaybackSnapshot, PlaybackState, PoseEvaluator};
pub use assets::{AnimationClip, AnimationTrack, AssetManager, ClipInterpolation, ModelBuilder, ModelData};
pub use cache::{CacheEntry, PoseSource, ResultCache};
pub use config::AnimationConfig;
pub use error::{AnimResult, AnimationError};
pub use instance::{InstanceId, InstanceManager};
pub use pose::{NodeTransform, PoseOutputs, PoseSnapshot};
pub use scene::{NodeIndex, SceneGraph};
pub use worker::{AnimationRequest, AnimationWorker, PoseCallback, RequestId};
