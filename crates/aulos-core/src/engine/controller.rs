//! Playback controller and device feed
//!
//! The public facade splits along the thread boundary: [`PlaybackController`]
//! is the control-thread handle (play/stop/seek, model registry, selection
//! and parameter changes), and [`DeviceFeed`] is the object the device
//! callback owns exclusively. State the callback needs arrives over a
//! lock-free command queue and is returned on a retirement queue, so the
//! callback never takes the engine lock, never allocates buffers it didn't
//! already own, and never frees anything.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::config::EngineTuning;
use crate::effect::AuditioningEffect;
use crate::error::{EngineError, EngineResult};
use crate::model::{ModelId, PlayableModel};
use crate::selection::{align_frame, Selection, SelectionSet};
use crate::timestretch::TimeStretchEngine;
use crate::types::{Sample, DEFAULT_SAMPLE_RATE, MAX_BLOCK_FRAMES};

use super::command::{feed_channel, retire_channel, FeedCommand, Retired};
use super::fill;
use super::position::{estimate_frame, EstimatorParams, TransportClock};
use super::range::PlayRangeList;
use super::ring_buffer::RingBuffer;

/// Overload strikes before a degradation step; consecutive over-budget
/// callbacks reset on every healthy block
const OVERLOAD_BUDGET_FRACTION: f64 = 0.8;

/// Bounded retries feeding the stretcher per callback, so a stalled
/// stretch engine cannot spin the device thread
const STRETCH_RETRY_LIMIT: usize = 8;

/// Notifications drained by the control thread
///
/// Real-time threads only bump counters or push here via the fill thread;
/// no observer code ever runs on the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A registered model disagrees with the negotiated sample rate;
    /// playback continues at the negotiated rate
    SampleRateMismatch { model: u32, negotiated: u32 },
    /// Target channel count changed after a model change
    ChannelLayoutChanged { channels: usize },
    /// Non-looping playback reached the end of the final play range
    PlaybackFinished,
    /// Producer-side overrun: frames dropped on write
    BufferOverrun { dropped: u64 },
    /// Consumer-side underrun: frames zero-padded on read
    BufferUnderrun { missing: u64 },
    /// The auditioning effect was disabled to shed CPU load
    EffectDisabled,
    /// The time stretch was folded down to mono to shed CPU load
    StretchMonoFallback,
    /// The sample rate converter failed or was downgraded
    ConverterDegraded { detail: String },
}

/// Shared state guarded by the coarse engine lock
///
/// Held briefly by control-thread operations and by each fill cycle. The
/// device callback never touches it.
pub(crate) struct EngineState {
    pub tuning: EngineTuning,
    pub models: Vec<(ModelId, Arc<dyn PlayableModel>)>,
    pub next_model_id: u64,
    /// Negotiated source rate (first registered dense rate wins)
    pub source_rate: Option<u32>,
    /// Device rate from set_target, when a device has negotiated
    pub device_rate: Option<u32>,
    /// Target channel count: max(2, max over the model set)
    pub channels: usize,
    /// One past the last frame of the material
    pub material_end: usize,
    pub selections: SelectionSet,
    pub selection_mode: bool,
    pub loop_mode: bool,
    pub ranges: Arc<PlayRangeList>,
    /// Fill-thread-owned buffer set
    pub write_set: Vec<Arc<RingBuffer>>,
    /// Mirror of the set the device callback currently reads
    pub read_set: Vec<Arc<RingBuffer>>,
    /// Write and read sets differ until the next unify
    pub decoupled: bool,
    /// Mixer cursor in timeline frames
    pub cursor: usize,
    /// Commands staged for the fill thread to forward to the callback
    pub pending: VecDeque<FeedCommand>,
    pub stretcher_installed: bool,
    pub events: Sender<EngineEvent>,
}

impl EngineState {
    pub(crate) fn target_rate(&self) -> u32 {
        self.device_rate
            .or(self.source_rate)
            .unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub(crate) fn send_event(&self, event: EngineEvent) {
        let _ = self.events.try_send(event);
    }
}

/// Everything the three threads share
pub(crate) struct EngineShared {
    pub state: Mutex<EngineState>,
    pub wake: Condvar,
    pub clock: TransportClock,
    origin: Instant,
}

impl EngineShared {
    /// Micros since engine construction; the time base for all clock fields
    pub(crate) fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

pub(crate) fn min_read_space(set: &[Arc<RingBuffer>]) -> usize {
    set.iter().map(|b| b.read_space()).min().unwrap_or(0)
}

fn alloc_buffer_set(channels: usize, capacity: usize) -> Vec<Arc<RingBuffer>> {
    (0..channels).map(|_| Arc::new(RingBuffer::new(capacity))).collect()
}

/// Control-thread handle to the playback engine
///
/// Dropping the controller shuts the fill thread down; the paired
/// [`DeviceFeed`] then only ever produces silence.
pub struct PlaybackController {
    shared: Arc<EngineShared>,
    events_rx: Receiver<EngineEvent>,
    fill: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackController {
    /// Create a controller and its paired device feed
    pub fn new(tuning: EngineTuning) -> (PlaybackController, DeviceFeed) {
        let capacity = tuning.ring_capacity_frames.max(MAX_BLOCK_FRAMES);
        let overload_trip = tuning.overload_trip_blocks.max(1);
        let (events_tx, events_rx) = bounded(tuning.event_queue_depth.max(1));
        let buffers = alloc_buffer_set(2, capacity);

        let state = EngineState {
            tuning,
            models: Vec::new(),
            next_model_id: 1,
            source_rate: None,
            device_rate: None,
            channels: 2,
            material_end: 0,
            selections: SelectionSet::new(),
            selection_mode: false,
            loop_mode: false,
            ranges: Arc::new(PlayRangeList::default()),
            write_set: buffers.clone(),
            read_set: buffers.clone(),
            decoupled: false,
            cursor: 0,
            pending: VecDeque::new(),
            stretcher_installed: false,
            events: events_tx,
        };

        let shared = Arc::new(EngineShared {
            state: Mutex::new(state),
            wake: Condvar::new(),
            clock: TransportClock::new(),
            origin: Instant::now(),
        });

        let (cmd_tx, cmd_rx) = feed_channel();
        let (retire_tx, retire_rx) = retire_channel();

        let fill = fill::spawn(Arc::clone(&shared), cmd_tx, retire_rx);

        let feed = DeviceFeed {
            shared: Arc::clone(&shared),
            read_set: buffers,
            cmd_rx,
            retire_tx,
            stretcher: None,
            effect: None,
            scratch: Vec::new(),
            overload_strikes: 0,
            overload_trip,
        };

        let controller = PlaybackController {
            shared,
            events_rx,
            fill: Some(fill),
        };

        (controller, feed)
    }

    // --- Model registry ---

    /// Register a source model
    ///
    /// The first dense rate registered wins the sample rate negotiation;
    /// a later conflicting model is still registered and mixed, but the
    /// conflict is reported as [`EngineEvent::SampleRateMismatch`] and
    /// playback proceeds at the previously negotiated rate. When the
    /// conflicting model is the only source, the engine adopts its rate
    /// instead.
    pub fn add_model(&self, model: Arc<dyn PlayableModel>) -> EngineResult<ModelId> {
        if model.channel_count() == 0 {
            return Err(EngineError::EmptyModel);
        }
        let mut state = self.shared.state.lock().unwrap();
        let model_rate = model.sample_rate();

        match state.source_rate {
            None => {
                state.source_rate = Some(model_rate);
                log::info!("negotiated source rate {} Hz", model_rate);
            }
            Some(rate) if rate == model_rate => {}
            Some(rate) => {
                if state.models.is_empty() {
                    state.source_rate = Some(model_rate);
                    log::info!("sole source changed negotiated rate {} -> {} Hz", rate, model_rate);
                } else {
                    log::warn!(
                        "model rate {} Hz conflicts with negotiated {} Hz; mixing at {} Hz",
                        model_rate,
                        rate,
                        rate
                    );
                    state.send_event(EngineEvent::SampleRateMismatch {
                        model: model_rate,
                        negotiated: rate,
                    });
                }
            }
        }

        let id = ModelId(state.next_model_id);
        state.next_model_id += 1;
        state.models.push((id, model));
        self.reconfigure(&mut state);
        self.shared.clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
        Ok(id)
    }

    /// Unregister a model; unknown ids are ignored
    pub fn remove_model(&self, id: ModelId) {
        let mut state = self.shared.state.lock().unwrap();
        let before = state.models.len();
        state.models.retain(|(mid, _)| *mid != id);
        if state.models.len() == before {
            log::debug!("remove_model: unknown id {:?}", id);
            return;
        }
        self.reconfigure(&mut state);
        self.shared.clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
    }

    /// Unregister every model
    pub fn clear_models(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.models.clear();
        self.reconfigure(&mut state);
        self.shared.clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
    }

    /// Recompute channel layout, material extent and play ranges after a
    /// model or device change; reallocates a decoupled write set when the
    /// current buffers no longer fit.
    fn reconfigure(&self, state: &mut EngineState) {
        let clock = &self.shared.clock;
        let channels = state
            .models
            .iter()
            .map(|(_, m)| m.channel_count())
            .max()
            .unwrap_or(0)
            .max(2);
        state.material_end = state
            .models
            .iter()
            .map(|(_, m)| m.end_frame())
            .max()
            .unwrap_or(0);
        state.ranges = Arc::new(PlayRangeList::rebuild(
            state.material_end,
            &state.selections,
            state.selection_mode,
        ));

        clock
            .source_rate
            .store(state.source_rate.unwrap_or(DEFAULT_SAMPLE_RATE), Ordering::Relaxed);
        clock.target_rate.store(state.target_rate(), Ordering::Relaxed);

        let block = clock.device_block_frames.load(Ordering::Relaxed) as usize;
        let needed_capacity = state.tuning.ring_capacity_frames.max(block * 4).max(MAX_BLOCK_FRAMES);
        let current_capacity = state.write_set.first().map(|b| b.capacity()).unwrap_or(0);

        if channels != state.write_set.len() || needed_capacity > current_capacity {
            log::info!(
                "reallocating ring buffers: {} channels x {} frames",
                channels,
                needed_capacity
            );
            state.write_set = alloc_buffer_set(channels, needed_capacity);
            state.decoupled = true;

            // The new set starts at the consumer's position: rebase the
            // fill counters so the unify prefix-skip starts at zero.
            if clock.playing.load(Ordering::Relaxed) {
                let consumed = clock.consumed_tgt.load(Ordering::Relaxed);
                let k = clock.source_rate.load(Ordering::Relaxed).max(1) as f64
                    / clock.target_rate.load(Ordering::Relaxed).max(1) as f64;
                let consumed_src = (consumed as f64 * k) as u64;
                clock.written_tgt.store(consumed, Ordering::Relaxed);
                clock.write_fill.store(consumed_src, Ordering::Relaxed);
                let start = clock.start_frame.load(Ordering::Relaxed) as usize;
                state.cursor = state.ranges.fold(
                    start,
                    consumed_src as i64,
                    clock.looping.load(Ordering::Relaxed),
                );
            }
        }

        if channels != state.channels {
            state.channels = channels;
            state.send_event(EngineEvent::ChannelLayoutChanged { channels });
            log::info!("target channel count now {}", channels);
        }
    }

    // --- Transport ---

    /// Start (or restart) playback from `start_frame`
    ///
    /// Always a full reset - ring buffers, converter and stretcher state,
    /// timestamps - even when already playing; a reseek is not a
    /// pause/resume. The epoch guard keeps the buffer reset safe against
    /// an in-flight device callback.
    pub fn play(&self, start_frame: usize) {
        let mut state = self.shared.state.lock().unwrap();
        let clock = &self.shared.clock;

        let start = if state.selection_mode && !state.selections.is_empty() {
            state.selections.constrain(start_frame)
        } else {
            start_frame.min(state.material_end)
        };

        let now = self.shared.now_us();
        clock.epoch.fetch_add(1, Ordering::AcqRel);
        for rb in state.write_set.iter().chain(state.read_set.iter()) {
            rb.reset();
        }
        clock.reset_counters(start, now);
        clock.frozen_frame.store(start as u64, Ordering::Relaxed);
        state.cursor = start;
        clock.epoch.fetch_add(1, Ordering::AcqRel);

        clock.playing.store(true, Ordering::Relaxed);
        clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
        log::debug!("play from frame {}", start);
    }

    /// Stop playback, freezing position reporting at the last estimate
    pub fn stop(&self) {
        let state = self.shared.state.lock().unwrap();
        let clock = &self.shared.clock;
        if clock.playing.load(Ordering::Relaxed) {
            let frame = self.estimate_locked(&state);
            clock.frozen_frame.store(frame as u64, Ordering::Relaxed);
        }
        clock.playing.store(false, Ordering::Relaxed);
        clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
        log::debug!("stopped");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.clock.playing.load(Ordering::Relaxed)
    }

    /// Estimate of the frame currently audible at the device
    ///
    /// The estimate is approximate: monotonic while playing without
    /// looping, and frozen at the last estimate while stopped.
    pub fn position(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        self.estimate_locked(&state)
    }

    fn estimate_locked(&self, state: &EngineState) -> usize {
        let unread = min_read_space(&state.read_set) as u64;
        let params = EstimatorParams {
            startup_clamp_ms: state.tuning.startup_clamp_ms,
        };
        estimate_frame(
            &self.shared.clock,
            &state.ranges,
            unread,
            &params,
            self.shared.now_us(),
        )
    }

    // --- Device negotiation ---

    /// Record the device's rate, block size and latency
    ///
    /// Grows the ring buffers when the block size threatens to exceed a
    /// quarter of their capacity.
    pub fn set_target(&self, sample_rate: u32, block_frames: usize, latency_frames: usize) {
        let mut state = self.shared.state.lock().unwrap();
        let clock = &self.shared.clock;
        state.device_rate = Some(sample_rate);
        clock.device_block_frames.store(block_frames as u64, Ordering::Relaxed);
        clock
            .device_latency_frames
            .store(latency_frames as u64, Ordering::Relaxed);
        log::info!(
            "device target: {} Hz, block {} frames, latency {} frames",
            sample_rate,
            block_frames,
            latency_frames
        );
        self.reconfigure(&mut state);
        clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
    }

    // --- Selections and loop mode ---

    pub fn set_selections(&self, spans: Vec<Selection>) {
        let mut state = self.shared.state.lock().unwrap();
        state.selections.set(spans);
        self.after_scope_change(&mut state);
    }

    /// Restrict playback to the selection set
    pub fn set_play_selection_mode(&self, on: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.selection_mode = on;
        self.after_scope_change(&mut state);
    }

    pub fn set_play_loop_mode(&self, on: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.loop_mode = on;
        self.shared.clock.looping.store(on, Ordering::Relaxed);
        self.after_scope_change(&mut state);
    }

    fn after_scope_change(&self, state: &mut EngineState) {
        state.ranges = Arc::new(PlayRangeList::rebuild(
            state.material_end,
            &state.selections,
            state.selection_mode,
        ));
        self.shared.clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
    }

    /// Current selection spans, in playback frames
    pub fn selections(&self) -> Vec<Selection> {
        let state = self.shared.state.lock().unwrap();
        state.selections.as_slice().to_vec()
    }

    pub fn play_selection_mode(&self) -> bool {
        self.shared.state.lock().unwrap().selection_mode
    }

    pub fn play_loop_mode(&self) -> bool {
        self.shared.state.lock().unwrap().loop_mode
    }

    /// Clamp a frame into the active selection set
    pub fn constrain_frame_to_selection(&self, frame: usize) -> usize {
        let state = self.shared.state.lock().unwrap();
        if state.selection_mode {
            state.selections.constrain(frame)
        } else {
            frame
        }
    }

    /// Map a reference-timeline frame onto the playback timeline
    pub fn align_reference_to_playback_frame(&self, frame: usize, reference_rate: u32) -> usize {
        let state = self.shared.state.lock().unwrap();
        align_frame(frame, reference_rate, state.source_rate.unwrap_or(reference_rate))
    }

    /// Map a playback-timeline frame onto a reference timeline
    pub fn align_playback_frame_to_reference(&self, frame: usize, reference_rate: u32) -> usize {
        let state = self.shared.state.lock().unwrap();
        align_frame(frame, state.source_rate.unwrap_or(reference_rate), reference_rate)
    }

    // --- Stretch and effect ---

    /// Set the playback speed factor (> 1.0 faster, < 1.0 slower)
    ///
    /// The stretch engine is built lazily on the first non-unity request
    /// and shipped to the device callback; construction failure degrades
    /// to unstretched playback.
    pub fn set_time_stretch(&self, ratio: f64) {
        let mut state = self.shared.state.lock().unwrap();
        let clock = &self.shared.clock;
        let ratio = ratio.clamp(0.1, 10.0);
        clock.set_stretch_ratio(ratio);

        if (ratio - 1.0).abs() > f64::EPSILON && !state.stretcher_installed {
            let rate = state.target_rate();
            let channels = state.channels;
            match TimeStretchEngine::new(channels, rate) {
                Ok(mut ts) => {
                    ts.set_time_ratio(ratio);
                    clock
                        .stretch_latency_frames
                        .store(ts.latency() as u64, Ordering::Relaxed);
                    state.pending.push_back(FeedCommand::SetStretcher(Some(Box::new(ts))));
                    state.stretcher_installed = true;
                    log::info!("time stretcher installed ({} ch, ratio {:.3})", channels, ratio);
                }
                Err(e) => {
                    log::warn!("time stretcher unavailable: {}; playing unstretched", e);
                    state.send_event(EngineEvent::ConverterDegraded {
                        detail: e.to_string(),
                    });
                }
            }
        }
        self.shared.wake.notify_all();
    }

    pub fn time_stretch(&self) -> f64 {
        self.shared.clock.stretch_ratio()
    }

    /// Install, replace or remove the auditioning effect
    ///
    /// The replaced instance is retired off the callback thread. A fresh
    /// install re-arms the overload kill switch.
    pub fn set_auditioning_effect(&self, effect: Option<Box<dyn AuditioningEffect>>) {
        let mut state = self.shared.state.lock().unwrap();
        self.shared.clock.effect_enabled.store(true, Ordering::Relaxed);
        state.pending.push_back(FeedCommand::SetEffect(effect));
        self.shared.wake.notify_all();
    }

    // --- Configuration and introspection ---

    /// Replace the tuning parameters
    ///
    /// Capacity changes take effect at the next buffer reallocation.
    pub fn set_tuning(&self, tuning: EngineTuning) {
        let mut state = self.shared.state.lock().unwrap();
        state.tuning = tuning;
        self.shared.clock.state_changed.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
    }

    /// Receiver for engine events; clone and drain from the control thread
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    /// Negotiated source rate, if any model has registered one
    pub fn source_rate(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().source_rate
    }

    /// Rate the engine currently feeds the device at
    pub fn target_rate(&self) -> u32 {
        self.shared.state.lock().unwrap().target_rate()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().unwrap().channels
    }

    /// One past the last frame of the registered material
    pub fn material_end(&self) -> usize {
        self.shared.state.lock().unwrap().material_end
    }

    /// Frames currently buffered for the device (minimum across channels)
    pub fn buffered_frames(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        min_read_space(&state.read_set)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.shared.clock.exiting.store(true, Ordering::Relaxed);
        self.shared.wake.notify_all();
        if let Some(handle) = self.fill.take() {
            let _ = handle.join();
        }
    }
}

/// Callback-side half of the engine: drains the ring buffers on demand
///
/// Owned by (and only ever touched from) the device callback thread. Move
/// it into the output stream's closure.
pub struct DeviceFeed {
    shared: Arc<EngineShared>,
    read_set: Vec<Arc<RingBuffer>>,
    cmd_rx: rtrb::Consumer<FeedCommand>,
    retire_tx: rtrb::Producer<Retired>,
    stretcher: Option<Box<TimeStretchEngine>>,
    effect: Option<Box<dyn AuditioningEffect>>,
    /// Per-channel stretch input scratch, grown geometrically
    scratch: Vec<Vec<Sample>>,
    overload_strikes: u32,
    overload_trip: u32,
}

impl DeviceFeed {
    /// The device-callback entry point
    ///
    /// Fills up to `frames` frames into the planar `buffers`, zero-filling
    /// any shortfall, and returns the number of valid frames. Never blocks:
    /// while stopped (or mid-reset) the output is silence and the return
    /// value 0.
    pub fn get_source_samples(&mut self, frames: usize, buffers: &mut [&mut [Sample]]) -> usize {
        let started = Instant::now();
        let shared = Arc::clone(&self.shared);
        let clock = &shared.clock;

        self.process_commands();

        let frames = frames.min(buffers.iter().map(|b| b.len()).min().unwrap_or(0));
        for ch in buffers.iter_mut() {
            ch[..frames].fill(0.0);
        }
        if frames == 0 {
            return 0;
        }

        if !clock.playing.load(Ordering::Relaxed) || self.read_set.is_empty() {
            return 0;
        }

        let epoch_before = clock.epoch.load(Ordering::Acquire);
        if epoch_before % 2 == 1 {
            // A reset is in progress on the control thread
            return 0;
        }

        let ratio = clock.stretch_ratio();
        if let Some(st) = self.stretcher.as_mut() {
            if (st.time_ratio() - ratio).abs() > 1e-9 {
                st.set_time_ratio(ratio);
                clock
                    .stretch_latency_frames
                    .store(st.latency() as u64, Ordering::Relaxed);
            }
        }
        let stretching = self
            .stretcher
            .as_ref()
            .map(|st| (ratio - 1.0).abs() > f64::EPSILON || st.available() > 0)
            .unwrap_or(false);

        let got = if stretching {
            self.drain_stretched(frames, buffers)
        } else {
            self.drain_direct(frames, buffers)
        };

        if got < frames {
            clock
                .underruns
                .fetch_add((frames - got) as u64, Ordering::Relaxed);
        }

        let epoch_after = clock.epoch.load(Ordering::Acquire);
        if epoch_after != epoch_before {
            // Raced a reset: the block may mix old and new content
            for ch in buffers.iter_mut() {
                ch[..frames].fill(0.0);
            }
            return 0;
        }

        self.apply_effect(buffers, frames);

        // An empty block advances nothing; freezing the timestamps lets
        // the estimator's wall-clock term carry the position through the
        // final latency tail instead
        if got > 0 {
            clock
                .last_block_frames
                .store(frames as u64, Ordering::Relaxed);
            clock
                .last_retrieved_us
                .store(self.shared.now_us(), Ordering::Relaxed);
            clock.timestamps_trusted.store(true, Ordering::Relaxed);
        }

        self.track_overload(started, frames, stretching);

        // Keep the fill thread ahead of us
        self.shared.wake.notify_one();

        got
    }

    /// Adopt commands sent by the fill thread; everything replaced goes
    /// back on the retirement queue
    fn process_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.pop() {
            match cmd {
                FeedCommand::AdoptBuffers(set) => {
                    let old = std::mem::replace(&mut self.read_set, set);
                    self.retire(Retired::Buffers(old));
                }
                FeedCommand::SetStretcher(st) => {
                    if let Some(old) = self.stretcher.take() {
                        self.retire(Retired::Stretcher(old));
                    }
                    self.stretcher = st;
                }
                FeedCommand::ResetStretcher => {
                    if let Some(st) = self.stretcher.as_mut() {
                        st.reset();
                    }
                }
                FeedCommand::SetEffect(fx) => {
                    if let Some(old) = self.effect.take() {
                        self.retire(Retired::Effect(old));
                    }
                    self.effect = fx;
                }
            }
        }
    }

    fn retire(&mut self, retired: Retired) {
        // The queue is drained every fill cycle; if it is somehow full the
        // object is dropped here, which is rare enough not to matter.
        let _ = self.retire_tx.push(retired);
    }

    /// No stretching: drain the ring buffers straight into the output
    fn drain_direct(&mut self, frames: usize, buffers: &mut [&mut [Sample]]) -> usize {
        let avail = min_read_space(&self.read_set);
        let take = frames.min(avail);
        let channels = self.read_set.len();
        for (ch, rb) in self.read_set.iter().enumerate() {
            if ch < buffers.len() {
                rb.read(&mut buffers[ch][..take]);
            } else {
                rb.skip(take);
            }
        }
        // Surplus output channels mirror channel 0
        for ch in channels..buffers.len() {
            let (head, tail) = buffers.split_at_mut(ch);
            tail[0][..take].copy_from_slice(&head[0][..take]);
        }
        self.shared
            .clock
            .consumed_tgt
            .fetch_add(take as u64, Ordering::Relaxed);
        take
    }

    /// Feed the stretcher incrementally until it can serve the block
    fn drain_stretched(&mut self, frames: usize, buffers: &mut [&mut [Sample]]) -> usize {
        let clock = &self.shared.clock;
        let Some(stretcher) = self.stretcher.as_mut() else {
            return 0;
        };
        let mono = stretcher.channel_count() == 1;
        let feed_channels = stretcher.channel_count();

        let mut tries = 0;
        while stretcher.available() < frames && tries < STRETCH_RETRY_LIMIT {
            let missing = frames - stretcher.available();
            let need = stretcher
                .samples_required(missing)
                .min(MAX_BLOCK_FRAMES);

            // Grow per-channel input scratch geometrically, then reuse
            while self.scratch.len() < feed_channels {
                self.scratch.push(Vec::new());
            }
            for ch in self.scratch.iter_mut() {
                if ch.len() < need {
                    ch.resize(need.next_power_of_two(), 0.0);
                }
            }

            let avail = min_read_space(&self.read_set);
            let take = need.min(avail);
            if mono {
                // Ad-hoc downmix: sum every channel into the first
                self.scratch[0][..need].fill(0.0);
                for rb in self.read_set.iter() {
                    rb.read_adding(&mut self.scratch[0][..take]);
                }
            } else {
                for (ch, rb) in self.read_set.iter().enumerate() {
                    if ch < feed_channels {
                        let got = rb.read(&mut self.scratch[ch][..take]);
                        self.scratch[ch][got..need].fill(0.0);
                    } else {
                        rb.skip(take);
                    }
                }
            }
            clock.consumed_tgt.fetch_add(take as u64, Ordering::Relaxed);

            let slices: Vec<&[Sample]> = self.scratch[..feed_channels]
                .iter()
                .map(|c| &c[..need])
                .collect();
            stretcher.process(&slices, need, false);
            tries += 1;
        }

        stretcher.retrieve(buffers, frames)
    }

    /// Run the auditioning effect in place when its geometry matches
    fn apply_effect(&mut self, buffers: &mut [&mut [Sample]], frames: usize) {
        let clock = &self.shared.clock;
        if !clock.effect_enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Some(fx) = self.effect.as_mut() {
            let ports_match = fx.audio_input_count() == buffers.len()
                && fx.audio_output_count() == buffers.len()
                && fx.block_size() >= frames;
            if ports_match {
                let time = clock.consumed_tgt.load(Ordering::Relaxed);
                fx.run(time, buffers, frames);
            }
        }
    }

    /// Detect processing overload and degrade instead of stopping:
    /// first the auditioning effect goes, then the stretch folds to mono
    fn track_overload(&mut self, started: Instant, frames: usize, stretching: bool) {
        let clock = &self.shared.clock;
        let rate = clock.target_rate.load(Ordering::Relaxed).max(1) as f64;
        let budget_us = frames as f64 / rate * 1e6;
        let spent_us = started.elapsed().as_micros() as f64;

        if spent_us > budget_us * OVERLOAD_BUDGET_FRACTION {
            self.overload_strikes += 1;
        } else {
            self.overload_strikes = 0;
            return;
        }

        if self.overload_strikes < self.overload_trip {
            return;
        }
        self.overload_strikes = 0;

        if self.effect.is_some() && clock.effect_enabled.load(Ordering::Relaxed) {
            clock.effect_enabled.store(false, Ordering::Relaxed);
        } else if stretching && !clock.mono_stretch.load(Ordering::Relaxed) {
            clock.mono_stretch_requested.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BufferModel;
    use std::time::Duration;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for engine");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn constant_model(frames: usize, value: Sample) -> Arc<dyn PlayableModel> {
        BufferModel::new(44100, vec![vec![value; frames]; 2])
            .unwrap()
            .into_shared()
    }

    /// Sample value encodes the frame index, so wraps are observable
    fn indexed_model(frames: usize) -> Arc<dyn PlayableModel> {
        let data: Vec<Sample> = (0..frames).map(|f| f as Sample * 1e-4).collect();
        BufferModel::new(44100, vec![data.clone(), data])
            .unwrap()
            .into_shared()
    }

    fn no_fade_tuning() -> EngineTuning {
        EngineTuning {
            boundary_fade_frames: 0,
            short_fade_frames: 0,
            ..EngineTuning::default()
        }
    }

    fn pull(feed: &mut DeviceFeed, frames: usize) -> (usize, Vec<Vec<Sample>>) {
        let mut bufs = vec![vec![0.0; frames]; 2];
        let got = {
            let mut refs: Vec<&mut [Sample]> = bufs.iter_mut().map(|b| b.as_mut_slice()).collect();
            feed.get_source_samples(frames, &mut refs)
        };
        (got, bufs)
    }

    #[test]
    fn test_stopped_returns_silence() {
        let (controller, mut feed) = PlaybackController::new(EngineTuning::default());
        controller
            .add_model(constant_model(44_100, 0.25))
            .unwrap();

        let (got, bufs) = pull(&mut feed, 1024);
        assert_eq!(got, 0);
        assert!(bufs.iter().all(|c| c.iter().all(|&s| s == 0.0)));
        assert!(!controller.is_playing());
    }

    #[test]
    fn test_same_rate_playback_to_drain() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        controller.add_model(constant_model(10_000, 0.25)).unwrap();
        controller.set_target(44100, 1024, 1024);
        controller.play(0);

        // Nine full blocks of non-silent audio
        for _ in 0..9 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let (got, bufs) = pull(&mut feed, 1024);
            assert_eq!(got, 1024);
            assert!(bufs[0].iter().all(|&s| (s - 0.25).abs() < 1e-6));
        }

        // Within one block of the end: a short block, zero-padded
        wait_until(|| controller.buffered_frames() == 784);
        let (got, bufs) = pull(&mut feed, 1024);
        assert_eq!(got, 784);
        assert!(bufs[0][784..].iter().all(|&s| s == 0.0));

        // Exhausted: silence from here on
        let (got, _) = pull(&mut feed, 1024);
        assert_eq!(got, 0);
    }

    #[test]
    fn test_selection_loop_wraps_to_selection_start() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        controller.add_model(indexed_model(44_100)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.set_selections(vec![Selection::new(1000, 2000)]);
        controller.set_play_selection_mode(true);
        controller.set_play_loop_mode(true);
        controller.play(1000);

        wait_until(|| controller.buffered_frames() >= 1024);
        let (got, bufs) = pull(&mut feed, 1024);
        assert_eq!(got, 1024);
        // Frames 0..1000 of the block are source frames 1000..2000; after
        // the wrap the next produced frame is source frame 1000, not 0
        assert!((bufs[0][0] - 0.1).abs() < 1e-5); // frame 1000
        assert!((bufs[0][999] - 0.1999).abs() < 1e-5); // frame 1999
        assert!((bufs[0][1000] - 0.1).abs() < 1e-5); // wrapped to 1000
    }

    #[test]
    fn test_position_monotonic_while_playing() {
        let (controller, mut feed) = PlaybackController::new(EngineTuning::default());
        controller.add_model(constant_model(441_000, 0.25)).unwrap();
        controller.set_target(44100, 1024, 1024);
        controller.play(0);

        let mut last = 0;
        for _ in 0..20 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let _ = pull(&mut feed, 1024);
            let pos = controller.position();
            assert!(pos >= last, "position went backwards: {} < {}", pos, last);
            last = pos;
        }
        assert!(controller.position() <= controller.material_end());
    }

    #[test]
    fn test_play_is_a_full_reset() {
        let (controller, mut feed) = PlaybackController::new(EngineTuning::default());
        controller.add_model(constant_model(441_000, 0.25)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.play(0);
        for _ in 0..8 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let _ = pull(&mut feed, 1024);
        }
        assert!(controller.position() > 0);

        // Replay from a new frame while still playing
        controller.play(22_050);
        assert_eq!(controller.position(), 22_050);
        assert!(controller.is_playing());
    }

    #[test]
    fn test_stop_freezes_position() {
        let (controller, mut feed) = PlaybackController::new(EngineTuning::default());
        controller.add_model(constant_model(441_000, 0.25)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.play(0);
        for _ in 0..4 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let _ = pull(&mut feed, 1024);
        }
        controller.stop();
        let frozen = controller.position();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(controller.position(), frozen);
    }

    #[test]
    fn test_rate_mismatch_reported_not_adopted() {
        let (controller, _feed) = PlaybackController::new(EngineTuning::default());
        let events = controller.events();
        controller.add_model(constant_model(44_100, 0.1)).unwrap();
        controller
            .add_model(
                BufferModel::new(48_000, vec![vec![0.1; 1000]; 2])
                    .unwrap()
                    .into_shared(),
            )
            .unwrap();

        assert_eq!(controller.source_rate(), Some(44_100));
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            event,
            EngineEvent::SampleRateMismatch {
                model: 48_000,
                negotiated: 44_100
            }
        );
    }

    #[test]
    fn test_sole_source_adopts_new_rate() {
        let (controller, _feed) = PlaybackController::new(EngineTuning::default());
        let id = controller.add_model(constant_model(44_100, 0.1)).unwrap();
        controller.remove_model(id);
        controller
            .add_model(
                BufferModel::new(48_000, vec![vec![0.1; 1000]; 2])
                    .unwrap()
                    .into_shared(),
            )
            .unwrap();
        assert_eq!(controller.source_rate(), Some(48_000));
    }

    #[test]
    fn test_channel_count_follows_model_set() {
        let (controller, _feed) = PlaybackController::new(EngineTuning::default());
        assert_eq!(controller.channel_count(), 2);
        controller
            .add_model(
                BufferModel::new(44_100, vec![vec![0.1; 100]; 4])
                    .unwrap()
                    .into_shared(),
            )
            .unwrap();
        assert_eq!(controller.channel_count(), 4);

        // Mono material still mixes to at least stereo
        controller.clear_models();
        controller
            .add_model(
                BufferModel::new(44_100, vec![vec![0.1; 100]])
                    .unwrap()
                    .into_shared(),
            )
            .unwrap();
        assert_eq!(controller.channel_count(), 2);
    }

    #[test]
    fn test_auditioning_effect_applied_in_place() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        controller.add_model(constant_model(441_000, 0.5)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.set_play_loop_mode(true);
        controller
            .set_auditioning_effect(Some(Box::new(crate::effect::GainEffect::new(2, 2048, 0.5))));
        controller.play(0);

        // The effect arrives over the command queue; poll until a scaled
        // block comes through
        let mut seen_scaled = false;
        for _ in 0..50 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let (got, bufs) = pull(&mut feed, 1024);
            assert_eq!(got, 1024);
            if bufs[0].iter().all(|&s| (s - 0.25).abs() < 1e-6) {
                seen_scaled = true;
                break;
            }
        }
        assert!(seen_scaled, "gain effect never applied");
    }

    #[test]
    fn test_mismatched_effect_geometry_is_skipped() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        controller.add_model(constant_model(441_000, 0.5)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.set_play_loop_mode(true);
        // 4-port effect against a stereo layout: must be ignored
        controller
            .set_auditioning_effect(Some(Box::new(crate::effect::GainEffect::new(4, 2048, 0.5))));
        controller.play(0);

        for _ in 0..10 {
            wait_until(|| controller.buffered_frames() >= 1024);
            let (got, bufs) = pull(&mut feed, 1024);
            assert_eq!(got, 1024);
            assert!(bufs[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_playback_finishes_with_event() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        let events = controller.events();
        controller.add_model(constant_model(4_096, 0.25)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.play(0);

        // Drain everything the engine produces
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.is_playing() && Instant::now() < deadline {
            let _ = pull(&mut feed, 1024);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!controller.is_playing());
        let finished = events
            .try_iter()
            .any(|e| e == EngineEvent::PlaybackFinished);
        assert!(finished, "PlaybackFinished event not delivered");
    }

    #[test]
    fn test_time_stretch_produces_output() {
        let (controller, mut feed) = PlaybackController::new(no_fade_tuning());
        controller.add_model(constant_model(441_000, 0.25)).unwrap();
        controller.set_target(44100, 1024, 0);
        controller.set_play_loop_mode(true);
        controller.set_time_stretch(0.5);
        controller.play(0);

        // Stretcher installation is asynchronous; eventually blocks come
        // back full and non-silent
        let mut non_silent_blocks = 0;
        for _ in 0..50 {
            wait_until(|| controller.buffered_frames() >= 4096);
            let (got, bufs) = pull(&mut feed, 1024);
            if got == 1024 && bufs[0].iter().any(|&s| s.abs() > 0.01) {
                non_silent_blocks += 1;
                if non_silent_blocks >= 5 {
                    break;
                }
            }
        }
        assert!(non_silent_blocks >= 5, "stretched playback produced no audio");
    }
}
