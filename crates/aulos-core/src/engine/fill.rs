//! Buffer fill engine: the background worker feeding the ring buffers
//!
//! A long-lived thread that repeatedly mixes the active source set - via
//! the sample rate converter when the device's rate differs - into the
//! write buffer set, republishes buffers to the device side (unify),
//! reclaims everything the callback retires, and turns degradation
//! counters into events. It sleeps on a timed condition wait sized to the
//! buffer capacity, shortened tenfold while playing, and is woken early on
//! any state change and by every device callback.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::EngineTuning;
use crate::resample::SampleRateConverter;
use crate::timestretch::TimeStretchEngine;
use crate::types::{Sample, MAX_BLOCK_FRAMES};

use super::command::{FeedCommand, Retired};
use super::controller::{min_read_space, EngineEvent, EngineShared, EngineState};
use super::mixer::{MixScope, ModelMixer};
use super::position::{estimate_frame, EstimatorParams};

/// Safety bound on converter iterations per cycle
const MAX_CONVERT_ROUNDS: usize = 64;

/// Spawn the fill thread
pub(crate) fn spawn(
    shared: Arc<EngineShared>,
    cmd_tx: rtrb::Producer<FeedCommand>,
    retire_rx: rtrb::Consumer<Retired>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("aulos-fill".to_string())
        .spawn(move || {
            let mut worker = FillWorker {
                shared,
                cmd_tx,
                retire_rx,
                mixer: ModelMixer::new(&EngineTuning::default()),
                converter: None,
                converter_spec: None,
                scratch: Vec::new(),
                conv_in: Vec::new(),
                seen_underruns: 0,
                seen_overruns: 0,
                effect_was_enabled: true,
            };
            worker.run();
        })
        .expect("failed to spawn buffer fill thread")
}

struct FillWorker {
    shared: Arc<EngineShared>,
    cmd_tx: rtrb::Producer<FeedCommand>,
    retire_rx: rtrb::Consumer<Retired>,
    mixer: ModelMixer,
    converter: Option<SampleRateConverter>,
    /// (source_rate, target_rate, channels, chunk) the converter was built
    /// for; None while rates match or construction failed
    converter_spec: Option<(u32, u32, usize, usize)>,
    /// Direct-path mix scratch, grown geometrically and reused
    scratch: Vec<Vec<Sample>>,
    /// Converter input staging; channel length is exactly the fixed chunk
    conv_in: Vec<Vec<Sample>>,
    seen_underruns: u64,
    seen_overruns: u64,
    effect_was_enabled: bool,
}

impl FillWorker {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        log::debug!("buffer fill thread running");

        let mut guard = shared.state.lock().unwrap();
        loop {
            if shared.clock.exiting.load(Ordering::Relaxed) {
                break;
            }
            self.cycle(&mut guard);
            let sleep = self.sleep_duration(&guard);
            let (g, _) = shared.wake.wait_timeout(guard, sleep).unwrap();
            guard = g;
        }
        drop(guard);

        self.drain_retired();
        log::debug!("buffer fill thread exiting");
    }

    fn cycle(&mut self, state: &mut EngineState) {
        let shared = Arc::clone(&self.shared);
        self.drain_retired();
        self.mixer.set_fades(&state.tuning);
        self.ensure_converter(state);

        if shared.clock.state_changed.swap(false, Ordering::Relaxed) {
            self.handle_state_change(state);
        }
        if shared.clock.playing.load(Ordering::Relaxed) {
            self.fill_once(state);
        }
        self.unify(state);
        self.check_finished(state);
        self.report_degradations(state);
        self.flush_pending(state);
    }

    fn sleep_duration(&self, state: &EngineState) -> Duration {
        let clock = &self.shared.clock;
        let rate = clock.target_rate.load(Ordering::Relaxed).max(1);
        let capacity = state
            .write_set
            .first()
            .map(|b| b.capacity())
            .unwrap_or(MAX_BLOCK_FRAMES);
        let mut secs = capacity as f64 / rate as f64;
        if clock.playing.load(Ordering::Relaxed) {
            secs /= 10.0;
        }
        Duration::from_secs_f64(secs.clamp(0.001, 2.0))
    }

    /// Drop everything the callback has relinquished
    fn drain_retired(&mut self) {
        while let Ok(retired) = self.retire_rx.pop() {
            match retired {
                Retired::Buffers(set) => {
                    log::debug!("reclaimed retired buffer set ({} channels)", set.len())
                }
                Retired::Stretcher(_) => log::debug!("reclaimed retired stretcher"),
                Retired::Effect(_) => log::debug!("reclaimed retired effect"),
            }
        }
    }

    /// Keep the converter matched to the negotiated rates and layout
    fn ensure_converter(&mut self, state: &mut EngineState) {
        let needed = match (state.source_rate, state.device_rate) {
            (Some(source), Some(device)) if source != device => Some((
                source,
                device,
                state.channels,
                state.tuning.source_block_frames.max(1),
            )),
            _ => None,
        };
        if needed == self.converter_spec {
            return;
        }

        self.converter = match needed {
            None => None,
            Some((source, device, channels, chunk)) => {
                match SampleRateConverter::new(source, device, channels, chunk) {
                    Ok(conv) => {
                        log::info!(
                            "sample rate converter: {} -> {} Hz, {} channels",
                            source,
                            device,
                            channels
                        );
                        self.conv_in = vec![vec![0.0; chunk]; channels];
                        Some(conv)
                    }
                    Err(e) => {
                        // Non-fatal: playback continues unconverted
                        log::warn!("sample rate converter unavailable: {}", e);
                        state.send_event(EngineEvent::ConverterDegraded {
                            detail: e.to_string(),
                        });
                        None
                    }
                }
            }
        };
        self.converter_spec = needed;
    }

    /// Reset buffers, counters and DSP state after a seek/stop/parameter
    /// change, so the next fill starts from silence with no stale samples
    fn handle_state_change(&mut self, state: &mut EngineState) {
        let shared = Arc::clone(&self.shared);
        let clock = &shared.clock;
        let now = shared.now_us();

        let untouched = clock.write_fill.load(Ordering::Relaxed) == 0
            && clock.consumed_tgt.load(Ordering::Relaxed) == 0;
        let frame = if untouched {
            // Right after play(): the controller already positioned us
            clock.start_frame.load(Ordering::Relaxed) as usize
        } else if clock.playing.load(Ordering::Relaxed) {
            self.estimate(state)
        } else {
            clock.frozen_frame.load(Ordering::Relaxed) as usize
        };
        let frame = if state.selection_mode && !state.selections.is_empty() {
            state.selections.constrain(frame)
        } else {
            frame.min(state.material_end)
        };

        clock.epoch.fetch_add(1, Ordering::AcqRel);
        for rb in state.write_set.iter().chain(state.read_set.iter()) {
            rb.reset();
        }
        clock.reset_counters(frame, now);
        clock.frozen_frame.store(frame as u64, Ordering::Relaxed);
        state.cursor = frame;
        clock.epoch.fetch_add(1, Ordering::AcqRel);

        let conv_ok = match self.converter.as_mut() {
            Some(conv) => conv.reset().is_ok(),
            None => true,
        };
        if !conv_ok {
            self.converter = None;
            self.converter_spec = None;
        }
        state.pending.push_back(FeedCommand::ResetStretcher);
        log::debug!("state change: refilling from frame {}", frame);
    }

    /// One fill pass: top the write buffers up as far as free space allows
    fn fill_once(&mut self, state: &mut EngineState) {
        let shared = Arc::clone(&self.shared);
        let clock = &shared.clock;
        let channels = state.channels;
        if state.write_set.len() < channels {
            return;
        }

        let free = state.write_set[..channels]
            .iter()
            .map(|b| b.write_space())
            .min()
            .unwrap_or(0);
        if free == 0 {
            return;
        }

        if self.converter.is_none() {
            // Rates match: mix straight into the ring buffers, rounded
            // down to the natural block size
            let block = state.tuning.source_block_frames.max(1);
            let want = (free / block) * block;
            if want == 0 {
                return;
            }
            while self.scratch.len() < channels {
                self.scratch.push(Vec::new());
            }
            for ch in self.scratch.iter_mut() {
                if ch.len() < want {
                    ch.resize(want.next_power_of_two(), 0.0);
                }
            }

            let (got, new_cursor) = {
                let scope = scope_of(state);
                self.mixer
                    .mix(&scope, state.cursor, &mut self.scratch[..channels], want)
            };
            for ch in 0..channels {
                let wrote = state.write_set[ch].write(&self.scratch[ch][..got]);
                if wrote < got {
                    clock.overruns.fetch_add((got - wrote) as u64, Ordering::Relaxed);
                }
            }
            state.cursor = new_cursor;
            clock.write_fill.fetch_add(got as u64, Ordering::Relaxed);
            clock.written_tgt.fetch_add(got as u64, Ordering::Relaxed);
            if got < want {
                clock.draining.store(true, Ordering::Relaxed);
            }
            return;
        }

        // Rates differ: mix fixed chunks through the converter. The fast
        // polynomial variant substitutes while the stretch ratio is
        // extreme, bounding the combined CPU cost.
        let ratio = clock.stretch_ratio();
        let threshold = state.tuning.extreme_stretch_ratio.max(1.0);
        let extreme = ratio >= threshold || ratio <= 1.0 / threshold;
        if let Some(conv) = self.converter.as_mut() {
            if conv.is_fast() != extreme {
                match conv.set_fast(extreme) {
                    Ok(()) => log::debug!(
                        "converter variant: {}",
                        if extreme { "fast (extreme stretch)" } else { "sinc" }
                    ),
                    Err(e) => log::warn!("converter variant switch failed: {}", e),
                }
            }
        }

        let mut free = free;
        let mut failed = false;
        for _ in 0..MAX_CONVERT_ROUNDS {
            let (chunk, max_out) = match self.converter.as_ref() {
                Some(c) => (c.input_chunk(), c.max_output()),
                None => return,
            };
            if free < max_out {
                break;
            }

            let (got, new_cursor) = {
                let scope = scope_of(state);
                self.mixer.mix(&scope, state.cursor, &mut self.conv_in, chunk)
            };
            if got == 0 {
                clock.draining.store(true, Ordering::Relaxed);
                break;
            }
            if got < chunk {
                // The converter consumes whole chunks; pad the tail
                for ch in self.conv_in.iter_mut() {
                    ch[got..chunk].fill(0.0);
                }
            }

            match self
                .converter
                .as_mut()
                .unwrap()
                .process(&self.conv_in)
            {
                Ok((produced, out)) => {
                    for ch in 0..channels {
                        let wrote = state.write_set[ch].write(&out[ch][..produced]);
                        if wrote < produced {
                            clock
                                .overruns
                                .fetch_add((produced - wrote) as u64, Ordering::Relaxed);
                        }
                    }
                    free = free.saturating_sub(produced);
                    clock.written_tgt.fetch_add(produced as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("sample rate conversion failed: {}", e);
                    state.send_event(EngineEvent::ConverterDegraded {
                        detail: e.to_string(),
                    });
                    failed = true;
                }
            }
            state.cursor = new_cursor;
            clock.write_fill.fetch_add(got as u64, Ordering::Relaxed);

            if failed || got < chunk {
                if got < chunk {
                    clock.draining.store(true, Ordering::Relaxed);
                }
                break;
            }
        }
        if failed {
            self.converter = None;
        }
    }

    /// Republish the write buffer set as the read set
    ///
    /// Deferred while the read side still has data to drain, or while the
    /// write side hasn't buffered a block yet (unless the material is at
    /// its end); any prefix the consumer has already passed is skipped
    /// first so no frame is duplicated or dropped across the hand-off.
    fn unify(&mut self, state: &mut EngineState) {
        let clock = &self.shared.clock;
        if !state.decoupled {
            clock
                .read_fill
                .store(clock.write_fill.load(Ordering::Relaxed), Ordering::Relaxed);
            return;
        }

        let read_unread = min_read_space(&state.read_set);
        let ws_buffered = min_read_space(&state.write_set);
        let block = clock.device_block_frames.load(Ordering::Relaxed).max(1) as usize;
        let draining = clock.draining.load(Ordering::Relaxed);

        if clock.playing.load(Ordering::Relaxed) {
            if read_unread > block {
                return; // let the old set drain down first
            }
            if ws_buffered < block && !draining {
                return; // nothing to hand over yet; swapping now would starve
            }
        }

        let ws_start = clock
            .written_tgt
            .load(Ordering::Relaxed)
            .saturating_sub(ws_buffered as u64);
        let consumed = clock.consumed_tgt.load(Ordering::Relaxed);
        if consumed > ws_start {
            let skip = (consumed - ws_start) as usize;
            for rb in state.write_set.iter() {
                rb.skip(skip);
            }
            log::debug!("unify: skipped {} already-consumed frames", skip);
        } else if consumed < ws_start {
            log::debug!("unify: {} frames lost across buffer hand-off", ws_start - consumed);
        }

        state.read_set = state.write_set.clone();
        state.decoupled = false;
        clock
            .read_fill
            .store(clock.write_fill.load(Ordering::Relaxed), Ordering::Relaxed);
        state
            .pending
            .push_back(FeedCommand::AdoptBuffers(state.read_set.clone()));
        log::debug!("ring buffer sets unified");
    }

    /// Automatic stop once non-looping playback has drained and the
    /// estimate has reached the end of the final range
    fn check_finished(&mut self, state: &mut EngineState) {
        let clock = &self.shared.clock;
        if !clock.playing.load(Ordering::Relaxed)
            || clock.looping.load(Ordering::Relaxed)
            || !clock.draining.load(Ordering::Relaxed)
        {
            return;
        }
        if min_read_space(&state.read_set) > 0 || state.ranges.total_frames() == 0 {
            return;
        }
        if self.estimate(state) >= state.ranges.last_end() {
            clock
                .frozen_frame
                .store(state.ranges.last_end() as u64, Ordering::Relaxed);
            clock.playing.store(false, Ordering::Relaxed);
            state.send_event(EngineEvent::PlaybackFinished);
            log::info!("playback finished");
        }
    }

    /// Turn degradation counters and flags into log lines and events
    fn report_degradations(&mut self, state: &mut EngineState) {
        let shared = Arc::clone(&self.shared);
        let clock = &shared.clock;

        let underruns = clock.underruns.load(Ordering::Relaxed);
        if underruns > self.seen_underruns {
            let missing = underruns - self.seen_underruns;
            log::debug!("underrun: {} frames zero-padded", missing);
            state.send_event(EngineEvent::BufferUnderrun { missing });
            self.seen_underruns = underruns;
        }

        let overruns = clock.overruns.load(Ordering::Relaxed);
        if overruns > self.seen_overruns {
            let dropped = overruns - self.seen_overruns;
            log::warn!("overrun: {} frames dropped", dropped);
            state.send_event(EngineEvent::BufferOverrun { dropped });
            self.seen_overruns = overruns;
        }

        let effect_enabled = clock.effect_enabled.load(Ordering::Relaxed);
        if self.effect_was_enabled && !effect_enabled {
            log::warn!("processing overload: auditioning effect disabled");
            state.send_event(EngineEvent::EffectDisabled);
        }
        self.effect_was_enabled = effect_enabled;

        if clock.mono_stretch_requested.swap(false, Ordering::Relaxed)
            && !clock.mono_stretch.load(Ordering::Relaxed)
        {
            self.install_mono_stretcher(state);
        }
    }

    /// Overload persisted past dropping the effect: fold the stretch down
    /// to a single cheaper channel rather than stopping playback
    fn install_mono_stretcher(&mut self, state: &mut EngineState) {
        let clock = &self.shared.clock;
        let rate = state.target_rate();
        match TimeStretchEngine::new_cheaper(1, rate) {
            Ok(mut ts) => {
                ts.set_time_ratio(clock.stretch_ratio());
                clock
                    .stretch_latency_frames
                    .store(ts.latency() as u64, Ordering::Relaxed);
                state
                    .pending
                    .push_back(FeedCommand::SetStretcher(Some(Box::new(ts))));
                clock.mono_stretch.store(true, Ordering::Relaxed);
                state.send_event(EngineEvent::StretchMonoFallback);
                log::warn!("processing overload: time stretch folded to mono");
            }
            Err(e) => log::warn!("mono stretcher unavailable: {}", e),
        }
    }

    /// Forward staged commands to the callback queue
    fn flush_pending(&mut self, state: &mut EngineState) {
        while let Some(cmd) = state.pending.pop_front() {
            if let Err(rtrb::PushError::Full(cmd)) = self.cmd_tx.push(cmd) {
                state.pending.push_front(cmd);
                break;
            }
        }
    }

    fn estimate(&self, state: &EngineState) -> usize {
        let params = EstimatorParams {
            startup_clamp_ms: state.tuning.startup_clamp_ms,
        };
        estimate_frame(
            &self.shared.clock,
            &state.ranges,
            min_read_space(&state.read_set) as u64,
            &params,
            self.shared.now_us(),
        )
    }
}

fn scope_of(state: &EngineState) -> MixScope<'_> {
    MixScope {
        models: &state.models,
        material_end: state.material_end,
        selections: &state.selections,
        constrained: state.selection_mode && !state.selections.is_empty(),
        looping: state.loop_mode,
    }
}
