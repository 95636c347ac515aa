//! Adaptive update pacing for one output.
//!
//! The pacer decides when the compositor may start the next frame. After each frame reaches the
//! screen it waits an "update interval" before serving the next update request, which lines
//! rendering up with vsync. On-time page flips slowly grow the interval up to a cap, a missed
//! vblank shrinks it right away.
//!
//! [`FramePacer`] is a plain state machine. It never touches the event loop itself: every entry
//! point returns the [`PacerAction`]s the caller has to carry out, in order.

use std::collections::VecDeque;
use std::time::Duration;

use arrayvec::ArrayVec;
use serde::Serialize;

use crate::output::OutputId;
use crate::page_flip::PageFlip;
use crate::utils::whole_millis;

/// Tunables, taken from the `pacing` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerConfig {
    pub default_idle_ms: u32,
    pub max_idle_ms: u32,
    pub on_time_threshold: u32,
    pub render_fluctuation_buffer_ms: u32,
    pub static_swap_buffer_ms: u32,
    pub frame_callback_max_step_ms: u32,
    pub adaptive_frame_callback: bool,
}

impl From<&tvsync_config::Pacing> for PacerConfig {
    fn from(config: &tvsync_config::Pacing) -> Self {
        Self {
            default_idle_ms: config.default_idle_ms,
            max_idle_ms: config.max_idle_ms,
            on_time_threshold: config.on_time_threshold,
            render_fluctuation_buffer_ms: config.render_fluctuation_buffer_ms,
            static_swap_buffer_ms: config.static_swap_buffer_ms,
            frame_callback_max_step_ms: config.frame_callback_max_step_ms,
            adaptive_frame_callback: config.adaptive_frame_callback,
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self::from(&tvsync_config::Pacing::default())
    }
}

/// What tells the pacer that a frame has been presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    /// Page flip notifications with hardware sequence numbers.
    PageFlip,
    /// Buffer swaps, with the update interval estimated from measured render time.
    SwapEstimate,
}

/// Coarse pipeline state, derived from the timer and the frames in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    /// Waiting for the update timer.
    UpdateScheduled,
    /// A frame has started and has not been presented yet.
    FrameInProgress,
}

/// Side effect the compositor carries out on behalf of the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerAction {
    /// (Re)arm the update timer. Replaces any timer already armed.
    ArmUpdateTimer(Duration),
    CancelUpdateTimer,
    /// Render a frame now.
    RequestRepaint,
    /// (Re)arm the frame callback timer.
    ArmFrameTimer(Duration),
    SendFrameCallbacks,
    /// The flip did not carry the next sequence number.
    FrameMissed { expected: u32, observed: u32 },
}

pub type PacerActions = ArrayVec<PacerAction, 4>;

/// Answer to an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    RepaintNow,
    /// Latched until the update timer fires or the frame in flight is aborted.
    Deferred,
}

/// Per-output counters, reported by the runner.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frames_started: u64,
    pub frames_presented: u64,
    pub frames_missed: u64,
    pub frames_aborted: u64,
    /// Flips whose sequence was not newer than the last one.
    pub stale_flips: u64,
    pub max_frames_in_flight: u32,
    /// Start of the last presented frame to its vblank.
    pub last_frame_time_us: u64,
    pub max_frame_time_us: u64,
    pub last_flip_interval_us: u64,
}

/// Timed frame callbacks, so clients start drawing just late enough to make the next update.
#[derive(Debug)]
struct FrameCallbackPacing {
    /// Delay from the end of rendering to the next frame callback.
    interval_ms: u32,
    /// Set when callbacks go out, cleared by the first damage after them.
    last_sent: Option<Duration>,
    /// First damage after the last frame callback.
    damaged_at: Option<Duration>,
    /// How long clients took from the last callback to damage.
    send_to_damage_ms: u32,
}

/// Started frames whose presentation we keep track of.
const MAX_TRACKED_FRAMES: usize = 8;

#[derive(Debug)]
pub struct FramePacer {
    output: OutputId,
    source: CompletionSource,
    config: PacerConfig,
    vsync_interval: Duration,

    /// Idle time between a page flip and serving the next update.
    update_interval_ms: u32,
    update_timer_armed: bool,
    /// An update arrived while the pipeline was busy.
    has_unhandled_update: bool,
    frames_in_flight: u32,
    /// Last hardware sequence seen, including zero.
    last_sequence: Option<u32>,
    /// Consecutive on-time flips since the last adjustment.
    on_time_streak: u32,

    /// Loop time of the last presentation.
    last_vblank: Option<Duration>,
    last_flip_timestamp: Option<Duration>,
    frame_started_at: VecDeque<Duration>,

    frame_callbacks: Option<FrameCallbackPacing>,

    sync_started_at: Option<Duration>,
    /// Duration of the last render, from synchronization to submission.
    render_time: Duration,

    stats: FrameStats,
}

impl FramePacer {
    pub fn new(
        output: OutputId,
        source: CompletionSource,
        vsync_interval: Duration,
        config: PacerConfig,
    ) -> Self {
        let mut pacer = Self {
            output,
            source,
            config,
            vsync_interval,
            update_interval_ms: config.default_idle_ms.min(config.max_idle_ms),
            update_timer_armed: false,
            has_unhandled_update: false,
            frames_in_flight: 0,
            last_sequence: None,
            on_time_streak: 0,
            last_vblank: None,
            last_flip_timestamp: None,
            frame_started_at: VecDeque::new(),
            frame_callbacks: None,
            sync_started_at: None,
            render_time: Duration::ZERO,
            stats: FrameStats::default(),
        };
        pacer.set_adaptive_frame_callback(config.adaptive_frame_callback);
        pacer
    }

    pub fn output(&self) -> OutputId {
        self.output
    }

    pub fn source(&self) -> CompletionSource {
        self.source
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    pub fn vsync_interval(&self) -> Duration {
        self.vsync_interval
    }

    pub fn update_interval_ms(&self) -> u32 {
        self.update_interval_ms
    }

    /// Current frame callback delay, when frame callbacks are paced.
    pub fn frame_interval_ms(&self) -> Option<u32> {
        self.frame_callbacks.as_ref().map(|p| p.interval_ms)
    }

    pub fn adaptive_frame_callbacks(&self) -> bool {
        self.frame_callbacks.is_some()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    pub fn on_time_streak(&self) -> u32 {
        self.on_time_streak
    }

    pub fn has_pending_update(&self) -> bool {
        self.has_unhandled_update
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn state(&self) -> PacerState {
        if self.frames_in_flight > 0 {
            PacerState::FrameInProgress
        } else if self.update_timer_armed {
            PacerState::UpdateScheduled
        } else {
            PacerState::Idle
        }
    }

    /// Applies reloaded tunables, keeping the learned interval within the new cap.
    pub fn reconfigure(&mut self, config: PacerConfig) {
        if self.config == config {
            return;
        }

        debug!("output {}: new pacing config {config:?}", self.output.get());
        self.config = config;
        self.update_interval_ms = self.update_interval_ms.min(config.max_idle_ms);
        self.set_adaptive_frame_callback(config.adaptive_frame_callback);
    }

    fn set_adaptive_frame_callback(&mut self, enabled: bool) {
        if enabled == self.frame_callbacks.is_some() {
            return;
        }

        self.frame_callbacks = enabled.then(|| FrameCallbackPacing {
            interval_ms: whole_millis(self.vsync_interval / 3),
            last_sent: None,
            damaged_at: None,
            send_to_damage_ms: 0,
        });
    }

    /// Something on the output changed and wants a new frame.
    pub fn update_requested(&mut self, now: Duration) -> UpdateDecision {
        if self.update_timer_armed || self.frames_in_flight != 0 {
            trace!(
                "output {}: deferring update, timer armed: {}, frames in flight: {}",
                self.output.get(),
                self.update_timer_armed,
                self.frames_in_flight
            );
            self.has_unhandled_update = true;
            return UpdateDecision::Deferred;
        }

        self.frame_started(now);
        UpdateDecision::RepaintNow
    }

    fn frame_started(&mut self, now: Duration) {
        self.has_unhandled_update = false;
        self.frames_in_flight += 1;
        self.stats.frames_started += 1;
        self.stats.max_frames_in_flight = self.stats.max_frames_in_flight.max(self.frames_in_flight);

        if self.frame_started_at.len() == MAX_TRACKED_FRAMES {
            self.frame_started_at.pop_front();
        }
        self.frame_started_at.push_back(now);

        if self.frames_in_flight > 1 {
            warn!(
                "output {}: {} frames in flight, expected at most one",
                self.output.get(),
                self.frames_in_flight
            );
        }
    }

    /// The update timer fired. Serves a latched update, if any.
    pub fn on_update_timer(&mut self, now: Duration) -> PacerActions {
        let mut actions = PacerActions::new();
        self.update_timer_armed = false;

        if self.has_unhandled_update {
            trace!("output {}: serving deferred update", self.output.get());
            self.frame_started(now);
            actions.push(PacerAction::RequestRepaint);
        }

        actions
    }

    /// A frame reached the screen.
    ///
    /// A gap in the sequence numbers shortens the update interval. Once nothing is in flight the
    /// update timer is armed.
    pub fn on_page_flip(&mut self, flip: &PageFlip, now: Duration) -> PacerActions {
        let _span = tracy_client::span!("FramePacer::on_page_flip");

        let mut actions = PacerActions::new();

        if self.source != CompletionSource::PageFlip {
            trace!(
                "output {}: ignoring page flip, pacing from swaps",
                self.output.get()
            );
            return actions;
        }

        // Sequence 0 carries no timing information, but the counter still passed through it.
        if flip.sequence == 0 {
            trace!(
                "output {}: page flip without a sequence number",
                self.output.get()
            );
            self.last_sequence = Some(0);
            return actions;
        }

        let mut missed = false;
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if flip.sequence != expected {
                actions.push(PacerAction::FrameMissed {
                    expected,
                    observed: flip.sequence,
                });

                // An old or repeated flip does not complete the frame in flight, and the sequence
                // baseline stays put.
                if (flip.sequence.wrapping_sub(last) as i32) <= 0 {
                    warn!(
                        "output {}: stale page flip {} after {last}",
                        self.output.get(),
                        flip.sequence
                    );
                    self.stats.stale_flips += 1;
                    self.frame_missed();
                    return actions;
                }

                debug!(
                    "output {}: frame missed, expected sequence {expected}, got {}",
                    self.output.get(),
                    flip.sequence
                );
                missed = true;
                self.frame_missed();
            }
        }
        self.last_sequence = Some(flip.sequence);

        if let Some(last) = self.last_flip_timestamp {
            self.stats.last_flip_interval_us = flip.timestamp.saturating_sub(last).as_micros() as u64;
        }
        self.last_flip_timestamp = Some(flip.timestamp);

        self.frame_finished(now, missed, &mut actions);
        actions
    }

    fn frame_missed(&mut self) {
        self.update_interval_ms = self.update_interval_ms.saturating_sub(1);
        self.on_time_streak = 0;
        self.stats.frames_missed += 1;
    }

    fn frame_finished(&mut self, now: Duration, missed: bool, actions: &mut PacerActions) {
        if self.frames_in_flight == 0 {
            debug!(
                "output {}: frame presented with no frame in flight",
                self.output.get()
            );
        } else {
            self.frames_in_flight -= 1;
        }
        self.stats.frames_presented += 1;

        if let Some(started) = self.frame_started_at.pop_front() {
            let frame_time = now.saturating_sub(started).as_micros() as u64;
            self.stats.last_frame_time_us = frame_time;
            self.stats.max_frame_time_us = self.stats.max_frame_time_us.max(frame_time);
        }

        if !missed {
            self.on_time_streak += 1;
            if self.on_time_streak >= self.config.on_time_threshold {
                self.update_interval_ms += 1;
                self.on_time_streak = 0;
            }
        }
        self.update_interval_ms = self.update_interval_ms.min(self.config.max_idle_ms);

        self.last_vblank = Some(now);

        if self.frames_in_flight == 0 {
            self.arm_update_timer(actions);
        }
    }

    fn arm_update_timer(&mut self, actions: &mut PacerActions) {
        self.update_timer_armed = true;
        actions.push(PacerAction::ArmUpdateTimer(Duration::from_millis(
            u64::from(self.update_interval_ms),
        )));
    }

    /// The renderer dropped the frame in flight.
    ///
    /// No page flip is coming for it, so an update latched in the meantime is served right away.
    pub fn on_frame_aborted(&mut self, now: Duration) -> PacerActions {
        let mut actions = PacerActions::new();

        debug!(
            "output {}: frame aborted with {} in flight",
            self.output.get(),
            self.frames_in_flight
        );
        self.frames_in_flight = 0;
        self.frame_started_at.clear();
        self.sync_started_at = None;
        self.stats.frames_aborted += 1;

        if self.has_unhandled_update {
            if self.update_timer_armed {
                self.update_timer_armed = false;
                actions.push(PacerAction::CancelUpdateTimer);
            }
            self.frame_started(now);
            actions.push(PacerAction::RequestRepaint);
        }

        actions
    }

    /// A client drew. Measures how quickly it answered the last frame callback.
    pub fn surface_damaged(&mut self, now: Duration) {
        let Some(pacing) = &mut self.frame_callbacks else {
            return;
        };

        if let Some(sent) = pacing.last_sent.take() {
            pacing.send_to_damage_ms = whole_millis(now.saturating_sub(sent));
            pacing.damaged_at = Some(now);
        }
    }

    /// The frame callback timer fired.
    pub fn on_frame_timer(&mut self, now: Duration) -> PacerActions {
        let mut actions = PacerActions::new();
        let output = self.output;
        let vsync_interval = self.vsync_interval;

        let Some(pacing) = &mut self.frame_callbacks else {
            return actions;
        };

        if pacing.last_sent.is_some() {
            trace!(
                "output {}: no damage since the last frame callback",
                output.get()
            );
            pacing.interval_ms = 0;
        }
        pacing.last_sent = Some(now);

        if let Some(damaged) = pacing.damaged_at.take() {
            let delay = now.saturating_sub(damaged);
            if delay > vsync_interval * 2 {
                warn!(
                    "output {}: frame callback sent {delay:?} after damage",
                    output.get()
                );
            }
        }

        actions.push(PacerAction::SendFrameCallbacks);
        actions
    }

    /// Start of buffer synchronization for the frame being rendered.
    pub fn before_synchronizing(&mut self, now: Duration) {
        self.sync_started_at = Some(now);
    }

    /// Rendering of the current frame finished.
    ///
    /// Updates the render time estimate and schedules the next frame callback so that clients
    /// have their next buffer ready just before the compositor starts the next frame.
    pub fn after_rendering(&mut self, now: Duration) -> PacerActions {
        let mut actions = PacerActions::new();

        if let Some(started) = self.sync_started_at.take() {
            self.render_time = now.saturating_sub(started);
        }

        let update_interval_ms = i64::from(self.update_interval_ms);
        let vsync_ms = self.vsync_interval.as_secs_f64() * 1000.;
        let vsync_ns = self.vsync_interval.as_nanos().max(1);
        let buffer_ms = i64::from(self.config.render_fluctuation_buffer_ms);
        let max_step = self.config.frame_callback_max_step_ms.max(1);

        let Some(last_vblank) = self.last_vblank else {
            return actions;
        };
        let Some(pacing) = &mut self.frame_callbacks else {
            return actions;
        };

        let since_vblank_ms = (now.saturating_sub(last_vblank).as_nanos() % vsync_ns) / 1_000_000;
        let remain_ms = (vsync_ms - since_vblank_ms as f64) as i64;
        let target = remain_ms + update_interval_ms
            - (i64::from(pacing.send_to_damage_ms) + buffer_ms);
        let target = u32::try_from(target.max(0)).unwrap_or(u32::MAX);

        pacing.interval_ms = step_toward(pacing.interval_ms, target, max_step);
        trace!(
            "output {}: frame callback in {} ms, target {target} ms",
            self.output.get(),
            pacing.interval_ms
        );

        actions.push(PacerAction::ArmFrameTimer(Duration::from_millis(
            u64::from(pacing.interval_ms),
        )));
        actions
    }

    /// Buffer swap on an output that reports no page flips.
    ///
    /// Estimates how long to idle from the last render time and re-arms the timers.
    pub fn frame_swapped(&mut self, now: Duration) -> PacerActions {
        let mut actions = PacerActions::new();

        if self.source != CompletionSource::SwapEstimate {
            return actions;
        }

        let spent_ms = i64::from(whole_millis(self.render_time))
            + i64::from(self.config.static_swap_buffer_ms);
        let vsync_ms = self.vsync_interval.as_secs_f64() * 1000.;
        let next = (vsync_ms
            - (spent_ms + i64::from(self.config.render_fluctuation_buffer_ms)) as f64)
            as i64;

        let current = self.update_interval_ms;
        let next = match u32::try_from(next) {
            Ok(next) if next > 0 => next,
            _ => current,
        };
        self.update_interval_ms = if current >= next { next } else { current + 1 };
        self.update_interval_ms = self.update_interval_ms.min(self.config.max_idle_ms);

        self.frames_in_flight = self.frames_in_flight.saturating_sub(1);
        self.stats.frames_presented += 1;
        if let Some(started) = self.frame_started_at.pop_front() {
            let frame_time = now.saturating_sub(started).as_micros() as u64;
            self.stats.last_frame_time_us = frame_time;
            self.stats.max_frame_time_us = self.stats.max_frame_time_us.max(frame_time);
        }
        self.last_vblank = Some(now);

        self.arm_update_timer(&mut actions);
        if let Some(pacing) = &self.frame_callbacks {
            actions.push(PacerAction::ArmFrameTimer(Duration::from_millis(
                u64::from(pacing.interval_ms),
            )));
        }

        actions
    }
}

fn step_toward(current: u32, target: u32, max_step: u32) -> u32 {
    if target > current {
        current + (target - current).min(max_step)
    } else {
        current - (current - target).min(max_step)
    }
}
