use crate::assets::{AnimationTrack, ClipInterpolation, TrackValues};
use glam::{Quat, Vec3, Vec4};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error("track has no keyframes")]
    Empty,
    #[error("track has {values} values for {times} keyframes")]
    LengthMismatch { times: usize, values: usize },
}

/// Pair of keyframe indices around a sample time and the position between them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bracket {
    pub i0: usize,
    pub i1: usize,
    pub fraction: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampledValue {
    Vec3(Vec3),
    Quat(Quat),
}

/// Binary search over ascending `times`. Times before the first key clamp to
/// `(0, 0, 0)`, times after the last clamp to `(last, last, 0)`. A NaN time
/// resolves to the first key.
pub fn find_bracket(times: &[f32], t: f32) -> Result<Bracket, TrackError> {
    let last = times.len().checked_sub(1).ok_or(TrackError::Empty)?;
    if last == 0 || t.is_nan() || t <= times[0] {
        return Ok(Bracket { i0: 0, i1: 0, fraction: 0.0 });
    }
    if t >= times[last] {
        return Ok(Bracket { i0: last, i1: last, fraction: 0.0 });
    }
    let i1 = times.partition_point(|&time| time <= t).clamp(1, last);
    let i0 = i1 - 1;
    let span = times[i1] - times[i0];
    let fraction = if span > f32::EPSILON { ((t - times[i0]) / span).clamp(0.0, 1.0) } else { 0.0 };
    Ok(Bracket { i0, i1, fraction })
}

pub fn sample_track(track: &AnimationTrack, t: f32) -> Result<SampledValue, TrackError> {
    check_lengths(track)?;
    let bracket = find_bracket(&track.times, t)?;
    interpolate(track, bracket.i0, bracket.i1, bracket.fraction)
}

pub fn interpolate(track: &AnimationTrack, i0: usize, i1: usize, fraction: f32) -> Result<SampledValue, TrackError> {
    check_lengths(track)?;
    let keys = track.times.len();
    if i0 >= keys || i1 >= keys {
        return Err(TrackError::LengthMismatch { times: keys, values: track.values.len() });
    }

    Ok(match (&track.values, track.interpolation) {
        (TrackValues::Vec3(values), ClipInterpolation::Step) => SampledValue::Vec3(values[i0]),
        (TrackValues::Quat(values), ClipInterpolation::Step) => SampledValue::Quat(values[i0]),
        (TrackValues::Vec3(values), ClipInterpolation::Linear) => {
            SampledValue::Vec3(values[i0].lerp(values[i1], fraction))
        }
        (TrackValues::Quat(values), ClipInterpolation::Linear) => {
            SampledValue::Quat(slerp_shortest(values[i0], values[i1], fraction))
        }
        (TrackValues::Vec3(values), ClipInterpolation::CubicSpline) => {
            let segment = CubicSegment::new(track, i0, i1, fraction);
            SampledValue::Vec3(segment.apply(
                values[3 * i0 + 1],
                values[3 * i0 + 2],
                values[3 * i1 + 1],
                values[3 * i1],
            ))
        }
        (TrackValues::Quat(values), ClipInterpolation::CubicSpline) => {
            let segment = CubicSegment::new(track, i0, i1, fraction);
            let blended = segment.apply(
                Vec4::from(values[3 * i0 + 1]),
                Vec4::from(values[3 * i0 + 2]),
                Vec4::from(values[3 * i1 + 1]),
                Vec4::from(values[3 * i1]),
            );
            SampledValue::Quat(normalize_or_identity(Quat::from_vec4(blended)))
        }
    })
}

/// Spherical interpolation along the shorter arc. `q1` is negated when the pair
/// lies in opposite hemispheres; nearly parallel inputs fall back to nlerp.
pub fn slerp_shortest(q0: Quat, q1: Quat, t: f32) -> Quat {
    let mut end = q1;
    let mut dot = q0.dot(q1);
    if dot < 0.0 {
        end = -q1;
        dot = -dot;
    }
    if dot > 0.9995 {
        let blended = Vec4::from(q0).lerp(Vec4::from(end), t);
        return normalize_or_identity(Quat::from_vec4(blended));
    }
    let theta = dot.clamp(-1.0, 1.0).acos();
    let sin_theta = theta.sin();
    let w0 = ((1.0 - t) * theta).sin() / sin_theta;
    let w1 = (t * theta).sin() / sin_theta;
    normalize_or_identity(Quat::from_vec4(Vec4::from(q0) * w0 + Vec4::from(end) * w1))
}

fn normalize_or_identity(q: Quat) -> Quat {
    if q.length_squared() > f32::EPSILON {
        q.normalize()
    } else {
        Quat::IDENTITY
    }
}

fn check_lengths(track: &AnimationTrack) -> Result<(), TrackError> {
    if track.times.is_empty() {
        return Err(TrackError::Empty);
    }
    let expected = track.times.len() * track.values_per_key();
    if track.values.len() != expected {
        return Err(TrackError::LengthMismatch { times: track.times.len(), values: track.values.len() });
    }
    Ok(())
}

/// Hermite basis for one keyframe segment, tangents scaled by the segment length.
struct CubicSegment {
    dt: f32,
    h00: f32,
    h10: f32,
    h01: f32,
    h11: f32,
}

impl CubicSegment {
    fn new(track: &AnimationTrack, i0: usize, i1: usize, t: f32) -> Self {
        let t2 = t * t;
        let t3 = t2 * t;
        Self {
            dt: track.times[i1] - track.times[i0],
            h00: 2.0 * t3 - 3.0 * t2 + 1.0,
            h10: t3 - 2.0 * t2 + t,
            h01: -2.0 * t3 + 3.0 * t2,
            h11: t3 - t2,
        }
    }

    fn apply<T>(&self, v0: T, out0: T, v1: T, in1: T) -> T
    where
        T: std::ops::Mul<f32, Output = T> + std::ops::Add<Output = T>,
    {
        v0 * self.h00 + out0 * (self.h10 * self.dt) + v1 * self.h01 + in1 * (self.h11 * self.dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn linear_vec3(times: Vec<f32>, values: Vec<Vec3>) -> AnimationTrack {
        AnimationTrack::translation(0, ClipInterpolation::Linear, times, values)
    }

    fn vec3_of(value: SampledValue) -> Vec3 {
        match value {
            SampledValue::Vec3(v) => v,
            other => panic!("expected vec3, got {other:?}"),
        }
    }

    fn quat_of(value: SampledValue) -> Quat {
        match value {
            SampledValue::Quat(q) => q,
            other => panic!("expected quat, got {other:?}"),
        }
    }

    #[test]
    fn bracket_clamps_outside_range() {
        let times = [0.0, 1.0, 2.0];
        assert_eq!(find_bracket(&times, -1.0), Ok(Bracket { i0: 0, i1: 0, fraction: 0.0 }));
        assert_eq!(find_bracket(&times, 0.0), Ok(Bracket { i0: 0, i1: 0, fraction: 0.0 }));
        assert_eq!(find_bracket(&times, 2.0), Ok(Bracket { i0: 2, i1: 2, fraction: 0.0 }));
        assert_eq!(find_bracket(&times, 9.0), Ok(Bracket { i0: 2, i1: 2, fraction: 0.0 }));
        assert_eq!(find_bracket(&[], 0.0), Err(TrackError::Empty));
    }

    #[test]
    fn non_finite_times_resolve_to_an_end_key() {
        let times = [0.0, 1.0, 2.0];
        assert_eq!(find_bracket(&times, f32::NAN), Ok(Bracket { i0: 0, i1: 0, fraction: 0.0 }));
        assert_eq!(find_bracket(&times, f32::NEG_INFINITY), Ok(Bracket { i0: 0, i1: 0, fraction: 0.0 }));
        assert_eq!(find_bracket(&times, f32::INFINITY), Ok(Bracket { i0: 2, i1: 2, fraction: 0.0 }));
        assert_eq!(find_bracket(&[f32::NAN, 1.0], 0.5), Ok(Bracket { i0: 0, i1: 1, fraction: 0.0 }));

        let track = AnimationTrack::translation(0, ClipInterpolation::Linear, times.to_vec(), vec![Vec3::X; 3]);
        assert_eq!(vec3_of(sample_track(&track, f32::NAN).expect("sample")), Vec3::X);
    }

    #[test]
    fn bracket_finds_interior_segment() {
        let bracket = find_bracket(&[0.0, 1.0, 3.0], 2.0).expect("bracket");
        assert_eq!((bracket.i0, bracket.i1), (1, 2));
        assert!((bracket.fraction - 0.5).abs() < 1e-6);
    }

    #[test]
    fn bracket_on_exact_interior_key_starts_segment() {
        let bracket = find_bracket(&[0.0, 1.0, 2.0], 1.0).expect("bracket");
        assert_eq!((bracket.i0, bracket.i1, bracket.fraction), (1, 2, 0.0));
    }

    #[test]
    fn step_holds_first_value_for_any_fraction() {
        let track = AnimationTrack::scale(0, ClipInterpolation::Step, vec![0.0, 1.0], vec![Vec3::ONE, Vec3::splat(4.0)]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let fraction: f32 = rng.gen_range(0.0..1.0);
            assert_eq!(vec3_of(interpolate(&track, 0, 1, fraction).expect("sample")), Vec3::ONE);
        }
    }

    #[test]
    fn linear_hits_endpoints_and_is_monotonic() {
        let track = linear_vec3(vec![0.0, 1.0], vec![Vec3::ZERO, Vec3::new(2.0, 4.0, -1.0)]);
        assert_eq!(vec3_of(interpolate(&track, 0, 1, 0.0).expect("start")), Vec3::ZERO);
        assert_eq!(vec3_of(interpolate(&track, 0, 1, 1.0).expect("end")), Vec3::new(2.0, 4.0, -1.0));

        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut fractions: Vec<f32> = (0..64).map(|_| rng.gen_range(0.0..=1.0)).collect();
        fractions.sort_by(f32::total_cmp);
        let mut previous = f32::NEG_INFINITY;
        for fraction in fractions {
            let x = vec3_of(interpolate(&track, 0, 1, fraction).expect("sample")).x;
            assert!(x >= previous - 1e-6);
            previous = x;
        }
    }

    #[test]
    fn quaternion_linear_takes_shorter_arc() {
        let q0 = Quat::from_xyzw(0.0, 0.0, 0.0, 1.0);
        let q1 = Quat::from_xyzw(0.0, 0.0, 0.0, -1.0);
        let track = AnimationTrack::rotation(0, ClipInterpolation::Linear, vec![0.0, 1.0], vec![q0, q1]);
        for fraction in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let q = quat_of(interpolate(&track, 0, 1, fraction).expect("sample"));
            assert!(q.dot(Quat::IDENTITY).abs() > 1.0 - 1e-5, "fraction {fraction} rotated to {q:?}");
        }
    }

    #[test]
    fn quaternion_linear_midpoint_is_half_angle() {
        let q1 = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let mid = slerp_shortest(Quat::IDENTITY, -q1, 0.5);
        let expected = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        assert!(mid.dot(expected).abs() > 1.0 - 1e-5);
    }

    #[test]
    fn cubic_spline_with_zero_tangents_eases_between_values() {
        let values = vec![Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, Vec3::X, Vec3::ZERO];
        let track = AnimationTrack::translation(0, ClipInterpolation::CubicSpline, vec![0.0, 2.0], values);
        assert_eq!(vec3_of(interpolate(&track, 0, 1, 0.0).expect("start")), Vec3::ZERO);
        assert_eq!(vec3_of(interpolate(&track, 0, 1, 1.0).expect("end")), Vec3::X);
        let mid = vec3_of(interpolate(&track, 0, 1, 0.5).expect("mid"));
        assert!((mid.x - 0.5).abs() < 1e-6);
        let quarter = vec3_of(interpolate(&track, 0, 1, 0.25).expect("quarter"));
        assert!(quarter.x < 0.25);
    }

    #[test]
    fn cubic_spline_tangents_scale_with_segment_duration() {
        // Constant slope of 1 unit/s over a 2s segment reproduces a straight line.
        let values = vec![Vec3::X, Vec3::ZERO, Vec3::X, Vec3::X, Vec3::splat(2.0) * Vec3::X, Vec3::X];
        let track = AnimationTrack::translation(0, ClipInterpolation::CubicSpline, vec![0.0, 2.0], values);
        let sample = vec3_of(sample_track(&track, 0.5).expect("sample"));
        assert!((sample.x - 0.5).abs() < 1e-5);
    }

    #[test]
    fn sampling_rejects_malformed_tracks() {
        let empty = linear_vec3(vec![], vec![]);
        assert_eq!(sample_track(&empty, 0.0), Err(TrackError::Empty));
        let short = linear_vec3(vec![0.0, 1.0], vec![Vec3::ZERO]);
        assert_eq!(sample_track(&short, 0.5), Err(TrackError::LengthMismatch { times: 2, values: 1 }));
    }

    #[test]
    fn sample_track_clamps_past_the_end() {
        let track = linear_vec3(vec![0.0, 1.0], vec![Vec3::ZERO, Vec3::Y]);
        assert_eq!(vec3_of(sample_track(&track, 5.0).expect("sample")), Vec3::Y);
    }
}
