//! Backend without real displays.
//!
//! Outputs can either have a simulated vblank thread that reports page flips through the
//! [`PageFlipNotifier`] the way a display driver would, have flips injected by hand, or report
//! no flips at all.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use super::RenderResult;
use crate::output::OutputId;
use crate::page_flip::{PageFlip, PageFlipNotifier};
use crate::utils::get_monotonic_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipMode {
    /// A thread per output reports a flip at the first vblank after each submitted frame.
    Simulated,
    /// Flips are injected by whoever holds the notifier.
    Manual,
    /// Outputs never report flips.
    Disabled,
}

pub struct Headless {
    flip_mode: FlipMode,
    outputs: HashMap<OutputId, HeadlessOutput>,
}

struct HeadlessOutput {
    name: String,
    vblank: Option<mpsc::Sender<()>>,
    renders: u64,
    fail_next: Option<RenderResult>,
}

impl Headless {
    pub fn new(flip_mode: FlipMode) -> Self {
        Self {
            flip_mode,
            outputs: HashMap::new(),
        }
    }

    pub fn flip_mode(&self) -> FlipMode {
        self.flip_mode
    }

    pub fn add_output(
        &mut self,
        output: OutputId,
        name: &str,
        refresh_interval: Duration,
        page_flips: Option<PageFlipNotifier>,
    ) -> anyhow::Result<bool> {
        let (vblank, reports_flips) = match (self.flip_mode, page_flips) {
            (FlipMode::Simulated, Some(notifier)) => {
                let vblank = spawn_vblank_thread(output, name, refresh_interval, notifier)?;
                (Some(vblank), true)
            }
            (FlipMode::Manual, Some(_)) => (None, true),
            _ => (None, false),
        };

        debug!(
            "headless output {name}: refresh interval {refresh_interval:?}, page flips: {reports_flips}"
        );

        self.outputs.insert(
            output,
            HeadlessOutput {
                name: name.to_owned(),
                vblank,
                renders: 0,
                fail_next: None,
            },
        );

        Ok(reports_flips)
    }

    pub fn remove_output(&mut self, output: OutputId) {
        // Dropping the sender stops the vblank thread.
        if let Some(removed) = self.outputs.remove(&output) {
            debug!("removed headless output {}", removed.name);
        }
    }

    pub fn render(&mut self, output: OutputId) -> RenderResult {
        let _span = tracy_client::span!("Headless::render");

        let Some(state) = self.outputs.get_mut(&output) else {
            error!("rendering to unknown output {}", output.get());
            return RenderResult::Aborted;
        };

        if let Some(result) = state.fail_next.take() {
            return result;
        }

        if let Some(vblank) = &state.vblank {
            if vblank.send(()).is_err() {
                warn!("vblank thread for {} is gone", state.name);
                state.vblank = None;
                return RenderResult::Aborted;
            }
        }

        state.renders += 1;
        RenderResult::Submitted
    }

    /// Makes the next render on `output` return `result` without submitting anything.
    pub fn fail_next_render(&mut self, output: OutputId, result: RenderResult) {
        if let Some(state) = self.outputs.get_mut(&output) {
            state.fail_next = Some(result);
        }
    }

    /// Number of frames submitted to `output`.
    pub fn renders(&self, output: OutputId) -> u64 {
        self.outputs.get(&output).map_or(0, |state| state.renders)
    }
}

fn spawn_vblank_thread(
    output: OutputId,
    name: &str,
    refresh_interval: Duration,
    notifier: PageFlipNotifier,
) -> anyhow::Result<mpsc::Sender<()>> {
    let (tx, rx) = mpsc::channel::<()>();
    let interval_ns = u64::try_from(refresh_interval.as_nanos())
        .unwrap_or(u64::MAX)
        .max(1);

    thread::Builder::new()
        .name(format!("vblank {name}"))
        .spawn(move || {
            let start = get_monotonic_time();

            while rx.recv().is_ok() {
                let since_start = get_monotonic_time().saturating_sub(start);
                let since_start_ns = u64::try_from(since_start.as_nanos()).unwrap_or(u64::MAX);

                // Scanout happens at the first vblank after submission.
                let count = since_start_ns / interval_ns + 1;
                let vblank = start + Duration::from_nanos(count.saturating_mul(interval_ns));

                let now = get_monotonic_time();
                if vblank > now {
                    thread::sleep(vblank - now);
                }

                let flip = PageFlip {
                    output,
                    // Hardware counters are 32-bit and wrap.
                    sequence: count as u32,
                    timestamp: vblank,
                };
                if let Err(err) = notifier.notify(flip) {
                    debug!("{err}");
                    break;
                }
            }

            trace!("vblank thread for output {} exiting", output.get());
        })
        .context("error spawning the vblank thread")?;

    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_flip::page_flip_channel;

    #[test]
    fn flip_modes() {
        let (notifier, _channel) = page_flip_channel();
        let interval = Duration::from_millis(16);

        let mut headless = Headless::new(FlipMode::Manual);
        assert!(headless
            .add_output(OutputId::new(1), "a", interval, Some(notifier.clone()))
            .unwrap());
        assert!(!headless
            .add_output(OutputId::new(2), "b", interval, None)
            .unwrap());

        let mut headless = Headless::new(FlipMode::Disabled);
        assert!(!headless
            .add_output(OutputId::new(1), "a", interval, Some(notifier))
            .unwrap());
    }

    #[test]
    fn forced_failures() {
        let mut headless = Headless::new(FlipMode::Disabled);
        let output = OutputId::new(1);
        headless
            .add_output(output, "a", Duration::from_millis(16), None)
            .unwrap();

        assert_eq!(headless.render(output), RenderResult::Submitted);
        headless.fail_next_render(output, RenderResult::Aborted);
        assert_eq!(headless.render(output), RenderResult::Aborted);
        assert_eq!(headless.render(output), RenderResult::Submitted);
        assert_eq!(headless.renders(output), 2);

        assert_eq!(headless.render(OutputId::new(5)), RenderResult::Aborted);
    }

    #[test]
    fn simulated_flips_follow_submissions() {
        let (notifier, channel) = page_flip_channel();
        let output = OutputId::new(1);

        let mut event_loop: calloop::EventLoop<'static, Vec<PageFlip>> =
            calloop::EventLoop::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(channel, |event, _, flips| {
                if let calloop::channel::Event::Msg(flip) = event {
                    flips.push(flip);
                }
            })
            .unwrap();

        let mut headless = Headless::new(FlipMode::Simulated);
        assert!(headless
            .add_output(output, "a", Duration::from_millis(2), Some(notifier))
            .unwrap());

        let mut flips = Vec::new();
        for _ in 0..3 {
            assert_eq!(headless.render(output), RenderResult::Submitted);
            let before = flips.len();
            for _ in 0..100 {
                if flips.len() > before {
                    break;
                }
                event_loop
                    .dispatch(Duration::from_millis(10), &mut flips)
                    .unwrap();
            }
        }

        assert_eq!(flips.len(), 3);
        assert!(flips.iter().all(|flip| flip.output == output));
        assert!(flips.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(flips.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
