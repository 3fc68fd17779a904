//! Model mixer: sums the active source set over a frame span
//!
//! Given a frame cursor and a requested count, produces that many summed
//! frames per channel, honoring material/selection boundaries, loop wraps
//! and boundary fades. Returning fewer frames than requested is how the
//! fill engine learns that playback reached a terminal boundary; it is not
//! an error.

use std::sync::Arc;

use crate::config::EngineTuning;
use crate::model::{ModelId, PlayableModel};
use crate::selection::SelectionSet;
use crate::types::Sample;

/// What the mixer is mixing against: the source set plus the playback
/// boundaries currently in force
pub struct MixScope<'a> {
    pub models: &'a [(ModelId, Arc<dyn PlayableModel>)],
    /// One past the last frame of the material
    pub material_end: usize,
    pub selections: &'a SelectionSet,
    /// Restrict playback to the selection set
    pub constrained: bool,
    pub looping: bool,
}

/// Boundary fade sizing policy
#[derive(Debug, Clone, Copy)]
pub struct FadeRule {
    nominal: usize,
    short: usize,
    short_threshold: usize,
    tiny_threshold: usize,
}

impl FadeRule {
    pub fn from_tuning(tuning: &EngineTuning) -> Self {
        Self {
            nominal: tuning.boundary_fade_frames,
            short: tuning.short_fade_frames,
            short_threshold: tuning.short_selection_frames,
            tiny_threshold: tuning.tiny_selection_frames,
        }
    }

    /// Fade lengths for a chunk cut from a `span`-frame playback region
    ///
    /// The nominal length shrinks for short selections, disappears for
    /// tiny ones, and never exceeds half the chunk.
    fn lengths(&self, span: usize, chunk: usize, want_in: bool, want_out: bool) -> (usize, usize) {
        let base = if span < self.tiny_threshold {
            0
        } else if span < self.short_threshold {
            self.short
        } else {
            self.nominal
        };
        let len = base.min(chunk / 2);
        (
            if want_in { len } else { 0 },
            if want_out { len } else { 0 },
        )
    }
}

/// Sums time-aligned source models into planar output
pub struct ModelMixer {
    fades: FadeRule,
}

impl ModelMixer {
    pub fn new(tuning: &EngineTuning) -> Self {
        Self {
            fades: FadeRule::from_tuning(tuning),
        }
    }

    pub fn set_fades(&mut self, tuning: &EngineTuning) {
        self.fades = FadeRule::from_tuning(tuning);
    }

    /// Mix up to `frames` frames starting at `cursor`
    ///
    /// `dest` channels are zeroed over the produced span first. Returns
    /// `(produced, new_cursor)`; `new_cursor` differs from
    /// `cursor + produced` whenever a boundary was jumped or wrapped.
    pub fn mix(
        &self,
        scope: &MixScope,
        cursor: usize,
        dest: &mut [Vec<Sample>],
        frames: usize,
    ) -> (usize, usize) {
        for ch in dest.iter_mut() {
            ch[..frames].fill(0.0);
        }

        let mut produced = 0;
        let mut pos = cursor;
        let mut fade_in_next = false;

        while produced < frames {
            let remaining = frames - produced;
            let boundary;
            let span;

            if scope.constrained {
                match scope.selections.containing(pos) {
                    Some(sel) => {
                        boundary = sel.end.min(scope.material_end);
                        span = sel.len().min(scope.material_end.saturating_sub(sel.start));
                    }
                    None => {
                        // Outside every selection: advance to the next one,
                        // wrap to the first when looping, or drain.
                        if let Some(next) = scope.selections.next_from(pos) {
                            if next.start < scope.material_end {
                                pos = next.start;
                                fade_in_next = true;
                                continue;
                            }
                        }
                        if scope.looping {
                            if let Some(first) = scope.selections.first() {
                                if first.start < scope.material_end && pos != first.start {
                                    pos = first.start;
                                    fade_in_next = true;
                                    continue;
                                }
                            }
                        }
                        break;
                    }
                }
            } else {
                if pos >= scope.material_end {
                    if scope.looping && scope.material_end > 0 {
                        pos = 0;
                        fade_in_next = true;
                        continue;
                    }
                    break;
                }
                boundary = scope.material_end;
                span = scope.material_end;
            }

            if pos >= boundary {
                break;
            }

            let chunk = remaining.min(boundary - pos);
            // Fade out only when this chunk reaches a boundary that
            // playback will continue past (loop wrap or another selection).
            let reaches_boundary = chunk == boundary - pos;
            let continues_past = if scope.constrained {
                scope.looping || scope.selections.next_from(boundary).is_some()
            } else {
                scope.looping
            };
            let (fade_in, fade_out) =
                self.fades
                    .lengths(span, chunk, fade_in_next, reaches_boundary && continues_past);

            let mut slices: Vec<&mut [Sample]> = dest
                .iter_mut()
                .map(|ch| &mut ch[produced..produced + chunk])
                .collect();
            for (_, model) in scope.models {
                model.mix_into(pos, chunk, &mut slices, fade_in, fade_out);
            }

            produced += chunk;
            pos += chunk;
            fade_in_next = false;
        }

        (produced, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::ramp_model;
    use crate::selection::Selection;
    use crate::types::zeroed_planar;

    fn no_fade_mixer() -> ModelMixer {
        ModelMixer::new(&EngineTuning {
            boundary_fade_frames: 0,
            short_fade_frames: 0,
            ..EngineTuning::default()
        })
    }

    fn models_of(frames: usize) -> Vec<(ModelId, Arc<dyn PlayableModel>)> {
        vec![(ModelId(1), ramp_model(44100, frames, 2).into_shared())]
    }

    fn selections(spans: &[(usize, usize)]) -> SelectionSet {
        let mut s = SelectionSet::new();
        s.set(spans.iter().map(|&(a, b)| Selection::new(a, b)).collect());
        s
    }

    #[test]
    fn test_mix_is_deterministic() {
        let mixer = ModelMixer::new(&EngineTuning::default());
        let models = models_of(10_000);
        let sels = SelectionSet::new();
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: false,
            looping: false,
        };

        let mut a = zeroed_planar(2, 512);
        let mut b = zeroed_planar(2, 512);
        let ra = mixer.mix(&scope, 100, &mut a, 512);
        let rb = mixer.mix(&scope, 100, &mut b, 512);
        assert_eq!(ra, rb);
        assert_eq!(a, b);
    }

    #[test]
    fn test_end_of_material_drains() {
        let mixer = no_fade_mixer();
        let models = models_of(1000);
        let sels = SelectionSet::new();
        let scope = MixScope {
            models: &models,
            material_end: 1000,
            selections: &sels,
            constrained: false,
            looping: false,
        };

        let mut out = zeroed_planar(2, 512);
        let (produced, cursor) = mixer.mix(&scope, 800, &mut out, 512);
        assert_eq!(produced, 200);
        assert_eq!(cursor, 1000);

        let (produced, cursor) = mixer.mix(&scope, cursor, &mut out, 512);
        assert_eq!(produced, 0);
        assert_eq!(cursor, 1000);
    }

    #[test]
    fn test_unconstrained_loop_wraps_to_zero() {
        let mixer = no_fade_mixer();
        let models = models_of(1000);
        let sels = SelectionSet::new();
        let scope = MixScope {
            models: &models,
            material_end: 1000,
            selections: &sels,
            constrained: false,
            looping: true,
        };

        let mut wrapped = zeroed_planar(2, 300);
        let (produced, cursor) = mixer.mix(&scope, 900, &mut wrapped, 300);
        assert_eq!(produced, 300);
        assert_eq!(cursor, 200);

        // Continuity: equal to [900, 1000) followed by [0, 200)
        let mut head = zeroed_planar(2, 100);
        let mut tail = zeroed_planar(2, 200);
        mixer.mix(&scope, 900, &mut head, 100);
        mixer.mix(&scope, 0, &mut tail, 200);
        assert_eq!(&wrapped[0][..100], &head[0][..]);
        assert_eq!(&wrapped[0][100..], &tail[0][..]);
    }

    #[test]
    fn test_selection_loop_wraps_to_selection_start() {
        let mixer = no_fade_mixer();
        let models = models_of(10_000);
        let sels = selections(&[(1000, 2000)]);
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: true,
        };

        // Cursor at the selection end: the next produced frame must be
        // frame 1000 of the source, not frame 0.
        let mut out = zeroed_planar(2, 64);
        let (produced, cursor) = mixer.mix(&scope, 2000, &mut out, 64);
        assert_eq!(produced, 64);
        assert_eq!(cursor, 1064);

        let mut reference = zeroed_planar(2, 64);
        mixer.mix(&scope, 1000, &mut reference, 64);
        assert_eq!(out, reference);
    }

    #[test]
    fn test_selection_loop_wrap_continuity() {
        let mixer = no_fade_mixer();
        let models = models_of(10_000);
        let sels = selections(&[(1000, 2000)]);
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: true,
        };

        let mut wrapped = zeroed_planar(2, 500);
        let (produced, cursor) = mixer.mix(&scope, 1800, &mut wrapped, 500);
        assert_eq!(produced, 500);
        assert_eq!(cursor, 1300);

        let mut head = zeroed_planar(2, 200);
        let mut tail = zeroed_planar(2, 300);
        mixer.mix(&scope, 1800, &mut head, 200);
        mixer.mix(&scope, 1000, &mut tail, 300);
        assert_eq!(&wrapped[0][..200], &head[0][..]);
        assert_eq!(&wrapped[0][200..], &tail[0][..]);
    }

    #[test]
    fn test_constrained_advances_between_selections() {
        let mixer = no_fade_mixer();
        let models = models_of(10_000);
        let sels = selections(&[(100, 200), (400, 500)]);
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: false,
        };

        let mut out = zeroed_planar(2, 200);
        let (produced, cursor) = mixer.mix(&scope, 100, &mut out, 200);
        assert_eq!(produced, 200);
        assert_eq!(cursor, 500);

        // Past the last selection: drain
        let (produced, _) = mixer.mix(&scope, cursor, &mut out, 200);
        assert_eq!(produced, 0);
    }

    #[test]
    fn test_constrained_without_loop_drains_after_last() {
        let mixer = no_fade_mixer();
        let models = models_of(10_000);
        let sels = selections(&[(1000, 1500)]);
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: false,
        };

        let mut out = zeroed_planar(2, 1000);
        let (produced, cursor) = mixer.mix(&scope, 1000, &mut out, 1000);
        assert_eq!(produced, 500);
        assert_eq!(cursor, 1500);
    }

    #[test]
    fn test_boundary_fades_attenuate_wrap_edges() {
        let loud = EngineTuning::default();
        let mixer = ModelMixer::new(&loud);
        // Constant-amplitude model so fades are visible
        let data = vec![vec![0.5; 10_000], vec![0.5; 10_000]];
        let model = crate::model::BufferModel::new(44100, data).unwrap();
        let models: Vec<(ModelId, Arc<dyn PlayableModel>)> =
            vec![(ModelId(1), model.into_shared())];
        let sels = selections(&[(1000, 2000)]);
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: true,
        };

        let mut out = zeroed_planar(2, 400);
        let (produced, _) = mixer.mix(&scope, 1800, &mut out, 400);
        assert_eq!(produced, 400);
        // Last frame before the wrap fades out, first frame after fades in
        assert!(out[0][199].abs() < 0.1);
        assert!(out[0][200].abs() < 0.1);
        // Mid-chunk frames are untouched
        assert!((out[0][100] - 0.5).abs() < 1e-6);
        assert!((out[0][399] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_tiny_selection_disables_fades() {
        let mixer = ModelMixer::new(&EngineTuning::default());
        let data = vec![vec![0.5; 10_000]];
        let model = crate::model::BufferModel::new(44100, data).unwrap();
        let models: Vec<(ModelId, Arc<dyn PlayableModel>)> =
            vec![(ModelId(1), model.into_shared())];
        let sels = selections(&[(1000, 1080)]); // under tiny_selection_frames
        let scope = MixScope {
            models: &models,
            material_end: 10_000,
            selections: &sels,
            constrained: true,
            looping: true,
        };

        let mut out = zeroed_planar(1, 160);
        let (produced, _) = mixer.mix(&scope, 1000, &mut out, 160);
        assert_eq!(produced, 160);
        assert!(out[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }
}
