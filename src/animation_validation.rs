use crate::assets::{AnimationClip, AnimationTrack, ClipInterpolation, TrackChannel, TrackValues};
use crate::error::AnimationError;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnimationValidationSeverity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AnimationValidationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnimationValidationSeverity::Info => write!(f, "info"),
            AnimationValidationSeverity::Warning => write!(f, "warning"),
            AnimationValidationSeverity::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnimationValidationEvent {
    pub severity: AnimationValidationSeverity,
    pub clip: Arc<str>,
    pub track: Option<usize>,
    pub message: String,
}

impl fmt::Display for AnimationValidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.track {
            Some(track) => write!(f, "[{}] clip '{}' track {}: {}", self.severity, self.clip, track, self.message),
            None => write!(f, "[{}] clip '{}': {}", self.severity, self.clip, self.message),
        }
    }
}

pub struct AnimationValidator;

impl AnimationValidator {
    /// Checks every track of `clip` against a model with `node_count` nodes.
    ///
    /// The first structural problem is returned as `MalformedTrack`; anything that
    /// still samples correctly comes back as warning or info events.
    pub fn validate_clip(clip: &AnimationClip, node_count: usize) -> Result<Vec<AnimationValidationEvent>, AnimationError> {
        let mut events = Vec::new();
        for (track_index, track) in clip.tracks.iter().enumerate() {
            if let Err(reason) = Self::check_track(track, node_count) {
                return Err(AnimationError::MalformedTrack { clip: Arc::clone(&clip.name), track: track_index, reason });
            }
            Self::track_events(clip, track_index, track, &mut events);
        }

        if clip.tracks.is_empty() {
            events.push(Self::event(clip, None, AnimationValidationSeverity::Warning, "clip does not define any tracks"));
        } else if clip.duration <= 0.0 {
            events.push(Self::event(
                clip,
                None,
                AnimationValidationSeverity::Warning,
                "clip duration is zero; every sample returns the first keyframe",
            ));
        }
        events.push(Self::event(
            clip,
            None,
            AnimationValidationSeverity::Info,
            format!("OK: duration {:.3}s, {} tracks", clip.duration, clip.tracks.len()),
        ));
        Ok(events)
    }

    /// Structural checks that would make sampling fail or index out of bounds.
    pub fn check_track(track: &AnimationTrack, node_count: usize) -> Result<(), String> {
        if track.node as usize >= node_count {
            return Err(format!("targets node {} but the model has {node_count} nodes", track.node));
        }
        if track.times.is_empty() {
            return Err("track has no keyframes".to_string());
        }
        let mut previous = f32::NEG_INFINITY;
        for (index, &time) in track.times.iter().enumerate() {
            if !time.is_finite() {
                return Err(format!("keyframe {index} has a non-finite time"));
            }
            if time < 0.0 {
                return Err(format!("keyframe {index} has negative time {time}"));
            }
            if time < previous {
                return Err(format!("keyframe {index} time {time} is earlier than {previous}"));
            }
            previous = time;
        }

        let expected = track.times.len() * track.values_per_key();
        if track.values.len() != expected {
            return Err(format!(
                "{} values for {} keyframes ({:?} needs {expected})",
                track.values.len(),
                track.times.len(),
                track.interpolation
            ));
        }

        match (track.channel, &track.values) {
            (TrackChannel::Rotation, TrackValues::Quat(_)) => Ok(()),
            (TrackChannel::Translation | TrackChannel::Scale, TrackValues::Vec3(_)) => Ok(()),
            (channel, _) => Err(format!("{} channel holds the wrong value type", channel.label())),
        }
    }

    fn track_events(
        clip: &AnimationClip,
        track_index: usize,
        track: &AnimationTrack,
        events: &mut Vec<AnimationValidationEvent>,
    ) {
        if track.times.len() == 1 {
            events.push(Self::event(
                clip,
                Some(track_index),
                AnimationValidationSeverity::Info,
                format!("{} track has a single keyframe and is constant", track.channel.label()),
            ));
        }
        if track.interpolation != ClipInterpolation::CubicSpline {
            if let TrackValues::Quat(values) = &track.values {
                let denormal = values.iter().filter(|q| (q.length_squared() - 1.0).abs() > 1e-3).count();
                if denormal > 0 {
                    events.push(Self::event(
                        clip,
                        Some(track_index),
                        AnimationValidationSeverity::Warning,
                        format!("{denormal} rotation keys are not unit length"),
                    ));
                }
            }
        }
    }

    fn event(
        clip: &AnimationClip,
        track: Option<usize>,
        severity: AnimationValidationSeverity,
        message: impl Into<String>,
    ) -> AnimationValidationEvent {
        AnimationValidationEvent { severity, clip: Arc::clone(&clip.name), track, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn clip_of(track: AnimationTrack) -> AnimationClip {
        AnimationClip::new("test", vec![track])
    }

    fn expect_malformed(track: AnimationTrack, node_count: usize) -> String {
        match AnimationValidator::validate_clip(&clip_of(track), node_count) {
            Err(AnimationError::MalformedTrack { track: 0, reason, .. }) => reason,
            other => panic!("expected malformed track, got {other:?}"),
        }
    }

    #[test]
    fn valid_clip_reports_summary() {
        let track = AnimationTrack::translation(0, ClipInterpolation::Linear, vec![0.0, 1.0], vec![Vec3::ZERO, Vec3::X]);
        let events = AnimationValidator::validate_clip(&clip_of(track), 1).expect("valid clip");
        assert!(events.iter().all(|event| event.severity == AnimationValidationSeverity::Info));
        assert!(events.last().expect("summary").message.contains("1 tracks"));
    }

    #[test]
    fn empty_times_are_rejected() {
        let reason = expect_malformed(AnimationTrack::scale(0, ClipInterpolation::Step, vec![], vec![]), 1);
        assert!(reason.contains("no keyframes"));
    }

    #[test]
    fn decreasing_times_are_rejected() {
        let track = AnimationTrack::translation(0, ClipInterpolation::Linear, vec![0.0, 2.0, 1.0], vec![Vec3::ZERO; 3]);
        assert!(expect_malformed(track, 1).contains("earlier"));
    }

    #[test]
    fn negative_and_nan_times_are_rejected() {
        let negative = AnimationTrack::translation(0, ClipInterpolation::Linear, vec![-1.0, 1.0], vec![Vec3::ZERO; 2]);
        assert!(expect_malformed(negative, 1).contains("negative"));
        let nan = AnimationTrack::translation(0, ClipInterpolation::Linear, vec![0.0, f32::NAN], vec![Vec3::ZERO; 2]);
        assert!(expect_malformed(nan, 1).contains("non-finite"));
    }

    #[test]
    fn cubic_tracks_need_three_values_per_key() {
        let track =
            AnimationTrack::translation(0, ClipInterpolation::CubicSpline, vec![0.0, 1.0], vec![Vec3::ZERO; 2]);
        assert!(expect_malformed(track, 1).contains("needs 6"));
        let ok = AnimationTrack::translation(0, ClipInterpolation::CubicSpline, vec![0.0, 1.0], vec![Vec3::ZERO; 6]);
        assert!(AnimationValidator::validate_clip(&clip_of(ok), 1).is_ok());
    }

    #[test]
    fn out_of_range_node_is_rejected() {
        let track = AnimationTrack::rotation(3, ClipInterpolation::Step, vec![0.0], vec![Quat::IDENTITY]);
        assert!(expect_malformed(track, 2).contains("node 3"));
    }

    #[test]
    fn mismatched_value_type_is_rejected() {
        let mut track = AnimationTrack::rotation(0, ClipInterpolation::Step, vec![0.0], vec![Quat::IDENTITY]);
        track.channel = TrackChannel::Scale;
        assert!(expect_malformed(track, 1).contains("wrong value type"));
    }

    #[test]
    fn non_unit_rotations_warn() {
        let track = AnimationTrack::rotation(
            0,
            ClipInterpolation::Linear,
            vec![0.0, 1.0],
            vec![Quat::IDENTITY, Quat::from_xyzw(0.0, 0.0, 0.0, 2.0)],
        );
        let events = AnimationValidator::validate_clip(&clip_of(track), 1).expect("still samples");
        assert!(events.iter().any(|event| event.severity == AnimationValidationSeverity::Warning));
    }
}
