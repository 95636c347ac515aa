//! Compositor state: outputs, their pacing and geometry transactions, driven by the event loop.

use std::collections::BTreeMap;
use std::mem;
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, LoopSignal, RegistrationToken};
use smithay::utils::{Logical, Rectangle, Size};
use tvsync_config::Config;

use crate::backend::{Backend, RenderResult};
use crate::frame_pacer::{
    CompletionSource, FramePacer, PacerAction, PacerActions, PacerConfig, UpdateDecision,
};
use crate::output::{DisplayOutput, OutputError, OutputId, OutputMode, Prepared};
use crate::page_flip::{insert_page_flip_source, PageFlip, PageFlipNotifier};
use crate::surface::{SurfaceId, SurfaceRegistry};
use crate::transaction::{Closed, Completion, RotationTransactionCoordinator};
use crate::utils::clock::Clock;
use crate::utils::id::IdCounter;

/// Everything the event loop callbacks get access to.
pub struct State {
    pub backend: Backend,
    pub tvsync: Tvsync,
}

/// Compositor state apart from the backend.
pub struct Tvsync {
    pub config: Config,

    pub event_loop: LoopHandle<'static, State>,
    pub stop_signal: LoopSignal,

    /// Frame clock. Cleared once per event loop iteration.
    pub clock: Clock,

    pub outputs: BTreeMap<OutputId, OutputState>,
    pub surfaces: SurfaceRegistry,
    pub rotation: RotationTransactionCoordinator,

    /// Handed to the backend for every output that reports flips.
    page_flips: PageFlipNotifier,
    output_ids: IdCounter,

    /// Notifications for clients, drained by [`Tvsync::take_events`].
    events: Vec<OutputEvent>,
}

/// One output and its pacing timers.
pub struct OutputState {
    pub display: DisplayOutput,
    pub pacing: OutputPacing,
    /// Armed update or fixed cadence timer.
    update_timer: Option<RegistrationToken>,
    /// Armed frame callback timer.
    frame_timer: Option<RegistrationToken>,
}

pub enum OutputPacing {
    Adaptive(FramePacer),
    /// Fixed idle time between frames, for outputs that report no page flips.
    Fixed(FixedCadence),
}

/// Renders at most once per `interval`, latching requests in between.
#[derive(Debug)]
pub struct FixedCadence {
    interval: Duration,
    armed: bool,
    queued: bool,
}

/// Notification for clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputEvent {
    /// A geometry change is waiting for clients to resize to `mode`.
    GeometryPending {
        output: OutputId,
        mode: OutputMode,
        watched: usize,
    },
    /// A geometry change was committed. Sent once per commit.
    ModeChanged {
        output: OutputId,
        mode: OutputMode,
    },
    FrameCallbacks {
        output: OutputId,
    },
    FrameMissed {
        output: OutputId,
        expected: u32,
        observed: u32,
    },
}

/// Outcome of [`Tvsync::request_geometry_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryRequest {
    /// Committed before returning.
    Committed,
    /// Waiting for `watched` surfaces to resize.
    Pending { watched: usize },
    /// Another change is in flight; this one runs after it.
    Queued,
    Unchanged,
}

impl FixedCadence {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            armed: false,
            queued: false,
        }
    }

    fn update_requested(&mut self) -> bool {
        if self.armed {
            self.queued = true;
            false
        } else {
            true
        }
    }

    fn rendered(&mut self) -> Duration {
        self.armed = true;
        self.queued = false;
        self.interval
    }

    fn on_timer(&mut self) -> bool {
        self.armed = false;
        mem::take(&mut self.queued)
    }
}

impl OutputState {
    pub fn pacer(&self) -> Option<&FramePacer> {
        match &self.pacing {
            OutputPacing::Adaptive(pacer) => Some(pacer),
            OutputPacing::Fixed(_) => None,
        }
    }

    pub fn has_update_timer(&self) -> bool {
        self.update_timer.is_some()
    }

    pub fn has_frame_timer(&self) -> bool {
        self.frame_timer.is_some()
    }
}

/// Picks the pacing mode for a new output.
fn make_pacing(
    config: &Config,
    output: OutputId,
    refresh_interval: Duration,
    reports_flips: bool,
) -> OutputPacing {
    let pacing = &config.pacing;
    let source = if pacing.disable_adaptive_update {
        None
    } else if reports_flips {
        Some(CompletionSource::PageFlip)
    } else if pacing.estimate_without_page_flip {
        Some(CompletionSource::SwapEstimate)
    } else {
        None
    };

    match source {
        Some(source) => OutputPacing::Adaptive(FramePacer::new(
            output,
            source,
            refresh_interval,
            PacerConfig::from(pacing),
        )),
        None => OutputPacing::Fixed(FixedCadence::new(Duration::from_millis(u64::from(
            pacing.fixed_idle_ms,
        )))),
    }
}

impl State {
    pub fn new(
        config: Config,
        event_loop: LoopHandle<'static, State>,
        stop_signal: LoopSignal,
        backend: Backend,
        clock: Clock,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("State::new");

        let (page_flips, _) =
            insert_page_flip_source(&event_loop, |flip, state: &mut State| {
                state.on_page_flip(flip)
            })?;

        let tvsync = Tvsync {
            config,
            event_loop,
            stop_signal,
            clock,
            outputs: BTreeMap::new(),
            surfaces: SurfaceRegistry::new(),
            rotation: RotationTransactionCoordinator::new(),
            page_flips,
            output_ids: IdCounter::new(),
            events: Vec::new(),
        };

        Ok(Self { backend, tvsync })
    }

    /// Runs once per event loop iteration.
    pub fn refresh(&mut self) {
        let _span = tracy_client::span!("State::refresh");
        self.tvsync.clock.clear();
    }

    /// Sets up an output from its config and announces its initial mode.
    pub fn add_output(&mut self, config: &tvsync_config::Output) -> anyhow::Result<OutputId> {
        let _span = tracy_client::span!("State::add_output");

        let id = OutputId::new(self.tvsync.output_ids.next());
        let timeout = self.tvsync.config.rotation_timeout_ms(&config.name);
        let display = DisplayOutput::new(
            id,
            config.name.clone(),
            &config.geometry,
            config.refresh_mhz,
            Duration::from_millis(u64::from(timeout)),
        );

        let page_flips = (!config.without_page_flip).then(|| self.tvsync.page_flips.clone());
        let reports_flips = self.backend.add_output(
            id,
            &config.name,
            display.refresh_interval(),
            page_flips,
        )?;

        let pacing = make_pacing(
            &self.tvsync.config,
            id,
            display.refresh_interval(),
            reports_flips,
        );
        let mode = display.mode();

        info!(
            "added output {} ({}): {:?} at {} mHz, {} pacing",
            id.get(),
            config.name,
            mode.size,
            mode.refresh_mhz,
            match &pacing {
                OutputPacing::Adaptive(pacer) if pacer.source() == CompletionSource::PageFlip =>
                    "page flip",
                OutputPacing::Adaptive(_) => "swap estimate",
                OutputPacing::Fixed(_) => "fixed",
            }
        );

        self.tvsync.outputs.insert(
            id,
            OutputState {
                display,
                pacing,
                update_timer: None,
                frame_timer: None,
            },
        );
        self.tvsync
            .events
            .push(OutputEvent::ModeChanged { output: id, mode });

        Ok(id)
    }

    /// Tears down an output along with its timers and any open transaction.
    pub fn remove_output(&mut self, output: OutputId) {
        let Some(mut state) = self.tvsync.outputs.remove(&output) else {
            return;
        };

        for token in [state.update_timer.take(), state.frame_timer.take()]
            .into_iter()
            .flatten()
        {
            self.tvsync.event_loop.remove(token);
        }
        if let Some(token) = self.tvsync.rotation.cancel(output) {
            self.tvsync.event_loop.remove(token);
        }

        self.backend.remove_output(output);
        info!("removed output {}", state.display.name());
    }

    /// Applies a reloaded config to live outputs.
    pub fn reload_config(&mut self, config: Config) {
        let _span = tracy_client::span!("State::reload_config");

        let pacer_config = PacerConfig::from(&config.pacing);
        for state in self.tvsync.outputs.values_mut() {
            let timeout = config.rotation_timeout_ms(state.display.name());
            state
                .display
                .set_transaction_timeout(Duration::from_millis(u64::from(timeout)));

            match &mut state.pacing {
                OutputPacing::Adaptive(pacer) => pacer.reconfigure(pacer_config),
                OutputPacing::Fixed(fixed) => {
                    fixed.interval = Duration::from_millis(u64::from(config.pacing.fixed_idle_ms));
                }
            }
        }

        self.tvsync.config = config;
        debug!("config reloaded");
    }

    /// Something on `output` changed and needs to be drawn.
    pub fn queue_redraw(&mut self, output: OutputId) {
        let now = self.tvsync.clock.now();
        let Some(state) = self.tvsync.outputs.get_mut(&output) else {
            return;
        };

        let redraw_now = match &mut state.pacing {
            OutputPacing::Adaptive(pacer) => {
                pacer.update_requested(now) == UpdateDecision::RepaintNow
            }
            OutputPacing::Fixed(fixed) => fixed.update_requested(),
        };

        if redraw_now {
            self.redraw(output);
        }
    }

    pub fn surface_damaged(&mut self, surface: SurfaceId) {
        let Some(output) = self.tvsync.surfaces.get(surface).map(|s| s.output()) else {
            return;
        };

        let now = self.tvsync.clock.now();
        if let Some(OutputState {
            pacing: OutputPacing::Adaptive(pacer),
            ..
        }) = self.tvsync.outputs.get_mut(&output)
        {
            pacer.surface_damaged(now);
        }

        self.queue_redraw(output);
    }

    fn redraw(&mut self, output: OutputId) {
        let _span = tracy_client::span!("State::redraw");

        let now = self.tvsync.clock.now();
        if let Some(OutputState {
            pacing: OutputPacing::Adaptive(pacer),
            ..
        }) = self.tvsync.outputs.get_mut(&output)
        {
            pacer.before_synchronizing(now);
        }

        let res = self.backend.render(output);

        // Rendering takes time.
        self.tvsync.clock.clear();
        let now = self.tvsync.clock.now();

        let Some(state) = self.tvsync.outputs.get_mut(&output) else {
            return;
        };

        let mut actions = PacerActions::new();
        match &mut state.pacing {
            OutputPacing::Adaptive(pacer) => match res {
                RenderResult::Submitted => {
                    actions = pacer.after_rendering(now);
                    actions.extend(pacer.frame_swapped(now));
                    if !pacer.adaptive_frame_callbacks() {
                        actions.push(PacerAction::SendFrameCallbacks);
                    }
                }
                RenderResult::NoDamage | RenderResult::Aborted => {
                    actions = pacer.on_frame_aborted(now);
                }
            },
            OutputPacing::Fixed(fixed) => {
                if res == RenderResult::Submitted {
                    actions.push(PacerAction::SendFrameCallbacks);
                }
                actions.push(PacerAction::ArmUpdateTimer(fixed.rendered()));
            }
        }

        self.apply_pacer_actions(output, actions);
    }

    /// The renderer dropped the frame in flight on `output` after it was submitted.
    pub fn on_frame_aborted(&mut self, output: OutputId) {
        let now = self.tvsync.clock.now();
        let Some(OutputState {
            pacing: OutputPacing::Adaptive(pacer),
            ..
        }) = self.tvsync.outputs.get_mut(&output)
        else {
            return;
        };

        let actions = pacer.on_frame_aborted(now);
        self.apply_pacer_actions(output, actions);
    }

    /// Entry point for flips coming over the bridge.
    pub fn on_page_flip(&mut self, flip: PageFlip) {
        let _span = tracy_client::span!("State::on_page_flip");

        let now = self.tvsync.clock.now();
        let Some(state) = self.tvsync.outputs.get_mut(&flip.output) else {
            debug!("page flip for unknown output {}", flip.output.get());
            return;
        };

        let actions = match &mut state.pacing {
            OutputPacing::Adaptive(pacer) => pacer.on_page_flip(&flip, now),
            OutputPacing::Fixed(_) => {
                trace!("ignoring page flip on a fixed cadence output");
                return;
            }
        };

        self.apply_pacer_actions(flip.output, actions);
    }

    fn on_update_timer(&mut self, output: OutputId) {
        let now = self.tvsync.clock.now();
        let Some(state) = self.tvsync.outputs.get_mut(&output) else {
            return;
        };
        state.update_timer = None;

        let mut actions = PacerActions::new();
        match &mut state.pacing {
            OutputPacing::Adaptive(pacer) => actions = pacer.on_update_timer(now),
            OutputPacing::Fixed(fixed) => {
                if fixed.on_timer() {
                    actions.push(PacerAction::RequestRepaint);
                }
            }
        }

        self.apply_pacer_actions(output, actions);
    }

    fn on_frame_timer(&mut self, output: OutputId) {
        let now = self.tvsync.clock.now();
        let Some(state) = self.tvsync.outputs.get_mut(&output) else {
            return;
        };
        state.frame_timer = None;

        let OutputPacing::Adaptive(pacer) = &mut state.pacing else {
            return;
        };
        let actions = pacer.on_frame_timer(now);
        self.apply_pacer_actions(output, actions);
    }

    /// Carries out pacer actions in order.
    fn apply_pacer_actions(&mut self, output: OutputId, actions: PacerActions) {
        for action in actions {
            match action {
                PacerAction::ArmUpdateTimer(delay) => {
                    self.arm_timer(output, delay, TimerKind::Update);
                }
                PacerAction::CancelUpdateTimer => {
                    if let Some(state) = self.tvsync.outputs.get_mut(&output) {
                        if let Some(token) = state.update_timer.take() {
                            self.tvsync.event_loop.remove(token);
                        }
                    }
                }
                PacerAction::RequestRepaint => self.redraw(output),
                PacerAction::ArmFrameTimer(delay) => {
                    self.arm_timer(output, delay, TimerKind::FrameCallback);
                }
                PacerAction::SendFrameCallbacks => {
                    self.tvsync.events.push(OutputEvent::FrameCallbacks { output });
                }
                PacerAction::FrameMissed { expected, observed } => {
                    self.tvsync.events.push(OutputEvent::FrameMissed {
                        output,
                        expected,
                        observed,
                    });
                }
            }
        }
    }

    /// Replaces the timer of `kind` on `output`.
    fn arm_timer(&mut self, output: OutputId, delay: Duration, kind: TimerKind) {
        let Some(state) = self.tvsync.outputs.get_mut(&output) else {
            return;
        };

        let slot = match kind {
            TimerKind::Update => &mut state.update_timer,
            TimerKind::FrameCallback => &mut state.frame_timer,
        };
        if let Some(token) = slot.take() {
            self.tvsync.event_loop.remove(token);
        }

        let timer = Timer::from_duration(delay);
        let res = self
            .tvsync
            .event_loop
            .insert_source(timer, move |_, _, state: &mut State| {
                match kind {
                    TimerKind::Update => state.on_update_timer(output),
                    TimerKind::FrameCallback => state.on_frame_timer(output),
                }
                TimeoutAction::Drop
            });

        match res {
            Ok(token) => *slot = Some(token),
            Err(err) => warn!("error inserting {kind:?} timer: {}", err.error),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Update,
    FrameCallback,
}

impl Tvsync {
    pub fn page_flip_notifier(&self) -> PageFlipNotifier {
        self.page_flips.clone()
    }

    pub fn output(&self, output: OutputId) -> Option<&DisplayOutput> {
        self.outputs.get(&output).map(|state| &state.display)
    }

    pub fn output_by_name(&self, name: &str) -> Option<OutputId> {
        self.outputs
            .values()
            .find(|state| state.display.name() == name)
            .map(|state| state.display.id())
    }

    pub fn take_events(&mut self) -> Vec<OutputEvent> {
        mem::take(&mut self.events)
    }

    pub fn add_surface(&mut self, output: OutputId, size: Size<i32, Logical>) -> SurfaceId {
        self.surfaces.add(output, size)
    }

    pub fn set_surface_minimized(&mut self, surface: SurfaceId, minimized: bool) {
        if self.surfaces.set_minimized(surface, minimized).is_none() {
            debug!("minimizing unknown surface {}", surface.get());
        }
    }

    /// Asks for `output` to be rotated to `rotation` degrees.
    ///
    /// Changes that swap the output axes wait for the affected surfaces to resize before being
    /// committed, unless the output has no transaction timeout.
    pub fn request_geometry_change(
        &mut self,
        output: OutputId,
        rotation: i32,
        forced: bool,
    ) -> Result<GeometryRequest, OutputError> {
        let _span = debug_span!("request_geometry_change", output = output.get(), rotation)
            .entered();

        let now = self.clock.now();
        let state = self
            .outputs
            .get_mut(&output)
            .ok_or(OutputError::UnknownOutput(output))?;
        let display = &mut state.display;

        let candidate = match display.prepare_change(rotation, forced) {
            Ok(Prepared::Change(candidate)) => candidate,
            Ok(Prepared::Unchanged) => return Ok(GeometryRequest::Unchanged),
            Ok(Prepared::Queued { superseded }) => {
                if let Some(superseded) = superseded {
                    debug!(
                        "rotation {} superseded by {rotation} before it was applied",
                        superseded.degrees()
                    );
                } else {
                    debug!("geometry change in flight, queueing rotation {rotation}");
                }
                return Ok(GeometryRequest::Queued);
            }
            Err(err) => {
                let name = display.name();
                warn!("{}: {err}", name);
                return Err(err);
            }
        };

        let needs_barrier = display.needs_barrier(&candidate);
        let timeout = display.transaction_timeout();
        display.begin(candidate);
        let pending_mode = display.candidate_mode();

        let watched = if needs_barrier {
            self.rotation
                .open(output, self.surfaces.on_output(output), timeout, now)
        } else {
            0
        };

        if watched == 0 {
            self.finalize_geometry(output);
            return Ok(GeometryRequest::Committed);
        }

        if let Some(mode) = pending_mode {
            self.events.push(OutputEvent::GeometryPending {
                output,
                mode,
                watched,
            });
        }
        self.register_rotation_deadline(output);

        Ok(GeometryRequest::Pending { watched })
    }

    /// Replaces the unrotated geometry and ratio of `output`, then re-sends its mode at
    /// `rotation` degrees even if nothing visible changed.
    pub fn set_base_geometry(
        &mut self,
        output: OutputId,
        geometry: Rectangle<i32, Logical>,
        rotation: i32,
        ratio: f64,
    ) -> Result<GeometryRequest, OutputError> {
        let state = self
            .outputs
            .get_mut(&output)
            .ok_or(OutputError::UnknownOutput(output))?;
        state.display.set_base(geometry, ratio);
        self.request_geometry_change(output, rotation, true)
    }

    fn register_rotation_deadline(&mut self, output: OutputId) {
        let Some(timeout) = self.rotation.pending_deadline(output) else {
            return;
        };

        let res = self.event_loop.insert_source(
            Timer::from_duration(timeout),
            move |_, _, state: &mut State| {
                state.tvsync.on_rotation_timeout(output);
                TimeoutAction::Drop
            },
        );

        match res {
            Ok(token) => self.rotation.set_deadline_timer(output, token),
            Err(err) => {
                warn!("error inserting rotation deadline timer: {}", err.error);
                let now = self.clock.now();
                if let Some(closed) = self.rotation.expire(output, now) {
                    self.close_transaction(closed);
                }
            }
        }
    }

    fn on_rotation_timeout(&mut self, output: OutputId) {
        let now = self.clock.now();
        if let Some(closed) = self.rotation.expire(output, now) {
            self.close_transaction(closed);
        }
    }

    /// A client surface was resized, possibly acknowledging a pending geometry.
    pub fn surface_resized(&mut self, surface: SurfaceId, size: Size<i32, Logical>) {
        match self.surfaces.resize(surface, size) {
            None => {
                debug!("resize of unknown surface {}", surface.get());
                return;
            }
            Some(false) => return,
            Some(true) => (),
        }

        let now = self.clock.now();
        if let Some(closed) = self.rotation.acknowledge(surface, now) {
            self.close_transaction(closed);
        }
    }

    pub fn surface_destroyed(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(surface).is_none() {
            return;
        }

        let now = self.clock.now();
        if let Some(closed) = self.rotation.forget_surface(surface, now) {
            self.close_transaction(closed);
        }
    }

    fn close_transaction(&mut self, closed: Closed) {
        if let Some(token) = closed.timer {
            self.event_loop.remove(token);
        }

        match closed.completion {
            Completion::Acknowledged => debug!(
                "output {}: all surfaces resized after {:?}",
                closed.output.get(),
                closed.elapsed
            ),
            Completion::TimedOut { unacknowledged } => debug!(
                "output {}: gave up on {unacknowledged} surfaces after {:?}",
                closed.output.get(),
                closed.elapsed
            ),
        }

        self.finalize_geometry(closed.output);
    }

    /// Commits the candidate of `output` and starts the queued change, if any.
    fn finalize_geometry(&mut self, output: OutputId) {
        let Some(state) = self.outputs.get_mut(&output) else {
            return;
        };
        let Some(committed) = state.display.finalize() else {
            error!("output {}: no geometry change to finalize", output.get());
            return;
        };

        self.events.push(OutputEvent::ModeChanged {
            output,
            mode: committed.mode,
        });

        if let Some(queued) = committed.queued {
            debug!(
                "output {}: applying queued rotation {}",
                output.get(),
                queued.degrees()
            );
            if let Err(err) = self.request_geometry_change(output, queued.degrees(), false) {
                warn!("error applying queued rotation: {err}");
            }
        }
    }
}
