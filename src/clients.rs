//! Synthetic clients for the headless runner.
//!
//! Each client owns one surface. It draws for a while after every frame callback and then
//! damages its surface, and it resizes to the new aspect ratio some time after its output
//! starts a geometry change.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use smithay::utils::Size;

use crate::compositor::{OutputEvent, State};
use crate::output::OutputId;
use crate::surface::SurfaceId;

pub struct SyntheticClients {
    render_time: Duration,
    resize_time: Duration,
    surfaces: Vec<SurfaceId>,
    /// Surfaces with a draw in progress.
    drawing: Rc<RefCell<HashSet<SurfaceId>>>,
}

impl SyntheticClients {
    /// Puts `per_output` clients on every output.
    pub fn spawn(
        state: &mut State,
        per_output: u32,
        render_time: Duration,
        resize_time: Duration,
    ) -> Self {
        let outputs: Vec<_> = state
            .tvsync
            .outputs
            .values()
            .map(|s| (s.display.id(), s.display.geometry().size))
            .collect();

        let mut surfaces = Vec::new();
        for (output, size) in outputs {
            for i in 0..per_output {
                let offset = 16 * (i32::try_from(i).unwrap_or(i32::MAX) + 1);
                let size = Size::from((size.w / 2 + offset, size.h / 2));
                surfaces.push(state.tvsync.add_surface(output, size));
            }
        }

        debug!("spawned {} synthetic clients", surfaces.len());

        Self {
            render_time,
            resize_time,
            surfaces,
            drawing: Rc::default(),
        }
    }

    pub fn surfaces(&self) -> &[SurfaceId] {
        &self.surfaces
    }

    /// Every client draws its first frame.
    pub fn start(&self, state: &mut State) {
        for &surface in &self.surfaces {
            state.surface_damaged(surface);
        }
    }

    pub fn dispatch_events(&self, state: &mut State) {
        for event in state.tvsync.take_events() {
            match event {
                OutputEvent::FrameCallbacks { output } => self.draw(state, output),
                OutputEvent::GeometryPending { output, mode, .. } => {
                    debug!(
                        "output {}: clients resizing for {:?}",
                        output.get(),
                        mode.size
                    );
                    self.resize(state, output);
                }
                OutputEvent::ModeChanged { output, mode } => {
                    info!(
                        "output {}: mode {:?} {:?} at {} mHz",
                        output.get(),
                        mode.size,
                        mode.transform,
                        mode.refresh_mhz
                    );
                }
                OutputEvent::FrameMissed {
                    output,
                    expected,
                    observed,
                } => {
                    trace!(
                        "output {}: missed vblank, expected {expected}, got {observed}",
                        output.get()
                    );
                }
            }
        }
    }

    fn on_output(&self, state: &State, output: OutputId) -> Vec<SurfaceId> {
        state
            .tvsync
            .surfaces
            .on_output(output)
            .map(|s| s.id())
            .filter(|id| self.surfaces.contains(id))
            .collect()
    }

    fn draw(&self, state: &mut State, output: OutputId) {
        for surface in self.on_output(state, output) {
            if !self.drawing.borrow_mut().insert(surface) {
                continue;
            }

            let drawing = self.drawing.clone();
            let res = state.tvsync.event_loop.insert_source(
                Timer::from_duration(self.render_time),
                move |_, _, state: &mut State| {
                    drawing.borrow_mut().remove(&surface);
                    state.surface_damaged(surface);
                    TimeoutAction::Drop
                },
            );
            if let Err(err) = res {
                warn!("error inserting client draw timer: {}", err.error);
                self.drawing.borrow_mut().remove(&surface);
            }
        }
    }

    fn resize(&self, state: &mut State, output: OutputId) {
        for surface in self.on_output(state, output) {
            let res = state.tvsync.event_loop.insert_source(
                Timer::from_duration(self.resize_time),
                move |_, _, state: &mut State| {
                    if let Some(size) = state.tvsync.surfaces.get(surface).map(|s| s.size()) {
                        state
                            .tvsync
                            .surface_resized(surface, Size::from((size.h, size.w)));
                        state.surface_damaged(surface);
                    }
                    TimeoutAction::Drop
                },
            );
            if let Err(err) = res {
                warn!("error inserting client resize timer: {}", err.error);
            }
        }
    }
}
