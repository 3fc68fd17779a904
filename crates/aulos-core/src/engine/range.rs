//! Play ranges: the spans of the timeline that "playing" covers
//!
//! Either the whole material (one range) or one range per active
//! selection. The list is rebuilt whenever selections, loop mode,
//! selection-play mode, or the material end change, and it is what the
//! position estimator folds elapsed play time through.

use crate::selection::SelectionSet;

/// A contiguous span of the timeline eligible for playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayRange {
    pub start: usize,
    pub duration: usize,
}

impl PlayRange {
    pub fn end(&self) -> usize {
        self.start + self.duration
    }
}

/// Ordered list of play ranges
///
/// Invariant: non-empty whenever the material duration is > 0.
#[derive(Debug, Clone, Default)]
pub struct PlayRangeList {
    ranges: Vec<PlayRange>,
}

impl PlayRangeList {
    /// Build the range list for the current playback scope
    pub fn rebuild(material_end: usize, selections: &SelectionSet, selection_mode: bool) -> Self {
        let mut ranges = Vec::new();
        if selection_mode && !selections.is_empty() {
            for s in selections.as_slice() {
                let start = s.start.min(material_end);
                let end = s.end.min(material_end);
                if end > start {
                    ranges.push(PlayRange {
                        start,
                        duration: end - start,
                    });
                }
            }
        }
        if ranges.is_empty() && material_end > 0 {
            ranges.push(PlayRange {
                start: 0,
                duration: material_end,
            });
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn as_slice(&self) -> &[PlayRange] {
        &self.ranges
    }

    /// Total playable frames across all ranges
    pub fn total_frames(&self) -> u64 {
        self.ranges.iter().map(|r| r.duration as u64).sum()
    }

    /// One past the last playable frame, or 0 when empty
    pub fn last_end(&self) -> usize {
        self.ranges.last().map(|r| r.end()).unwrap_or(0)
    }

    /// Distance, in playable frames, from the list's beginning to `frame`
    ///
    /// Frames before the first range map to 0; frames between ranges snap
    /// forward to the next range; frames past the last range map to the
    /// total.
    pub fn progress_of(&self, frame: usize) -> u64 {
        let mut acc = 0u64;
        for r in &self.ranges {
            if frame < r.start {
                return acc;
            }
            if frame < r.end() {
                return acc + (frame - r.start) as u64;
            }
            acc += r.duration as u64;
        }
        acc
    }

    /// The timeline frame `progress` playable frames into the list
    ///
    /// `progress` is clamped to the total; at exactly the total this
    /// returns the last range's end.
    pub fn frame_at_progress(&self, progress: u64) -> usize {
        let mut rest = progress;
        for r in &self.ranges {
            if rest < r.duration as u64 {
                return r.start + rest as usize;
            }
            rest -= r.duration as u64;
        }
        self.last_end()
    }

    /// Fold a signed elapsed-frame offset from `start_frame` back into the
    /// timeline
    ///
    /// When looping, the offset wraps modulo the total (so a negative
    /// offset lands in the last range); otherwise it clamps at both ends,
    /// with negative offsets folding into the previous range.
    pub fn fold(&self, start_frame: usize, elapsed: i64, looping: bool) -> usize {
        let total = self.total_frames() as i64;
        if total == 0 {
            return start_frame;
        }
        let mut p = self.progress_of(start_frame) as i64 + elapsed;
        if looping {
            p = p.rem_euclid(total);
        } else {
            p = p.clamp(0, total);
        }
        self.frame_at_progress(p as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Selection;

    fn selections(spans: &[(usize, usize)]) -> SelectionSet {
        let mut s = SelectionSet::new();
        s.set(spans.iter().map(|&(a, b)| Selection::new(a, b)).collect());
        s
    }

    #[test]
    fn test_rebuild_whole_material() {
        let list = PlayRangeList::rebuild(1000, &SelectionSet::new(), false);
        assert_eq!(list.as_slice(), &[PlayRange { start: 0, duration: 1000 }]);
        assert_eq!(list.total_frames(), 1000);
    }

    #[test]
    fn test_rebuild_from_selections_clips_to_material() {
        let list = PlayRangeList::rebuild(450, &selections(&[(100, 200), (400, 600)]), true);
        assert_eq!(
            list.as_slice(),
            &[
                PlayRange { start: 100, duration: 100 },
                PlayRange { start: 400, duration: 50 },
            ]
        );
    }

    #[test]
    fn test_selection_mode_without_selections_falls_back() {
        let list = PlayRangeList::rebuild(1000, &SelectionSet::new(), true);
        assert_eq!(list.total_frames(), 1000);
    }

    #[test]
    fn test_empty_material_yields_empty_list() {
        let list = PlayRangeList::rebuild(0, &SelectionSet::new(), false);
        assert!(list.is_empty());
        assert_eq!(list.fold(123, 50, false), 123);
    }

    #[test]
    fn test_progress_mapping() {
        let list = PlayRangeList::rebuild(1000, &selections(&[(100, 200), (400, 500)]), true);
        assert_eq!(list.progress_of(100), 0);
        assert_eq!(list.progress_of(150), 50);
        assert_eq!(list.progress_of(300), 100); // between ranges snaps forward
        assert_eq!(list.progress_of(450), 150);
        assert_eq!(list.progress_of(900), 200);

        assert_eq!(list.frame_at_progress(0), 100);
        assert_eq!(list.frame_at_progress(120), 420);
        assert_eq!(list.frame_at_progress(200), 500);
    }

    #[test]
    fn test_fold_advances_across_ranges() {
        let list = PlayRangeList::rebuild(1000, &selections(&[(100, 200), (400, 500)]), true);
        assert_eq!(list.fold(150, 30, false), 180);
        assert_eq!(list.fold(150, 80, false), 430); // crosses into second range
        assert_eq!(list.fold(150, 10_000, false), 500); // clamps at end
    }

    #[test]
    fn test_fold_looping_wraps() {
        let list = PlayRangeList::rebuild(1000, &selections(&[(100, 200), (400, 500)]), true);
        assert_eq!(list.fold(450, 60, true), 110); // wraps to first range
        assert_eq!(list.fold(100, -10, true), 490); // negative folds to last range
    }

    #[test]
    fn test_fold_negative_clamps_when_not_looping() {
        let list = PlayRangeList::rebuild(1000, &SelectionSet::new(), false);
        assert_eq!(list.fold(5, -50, false), 0);
    }
}
