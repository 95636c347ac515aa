use std::time::Duration;

use crate::output::OutputId;
use crate::page_flip::PageFlipNotifier;

pub mod headless;
pub use headless::Headless;

pub enum Backend {
    Headless(Headless),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderResult {
    /// The frame was queued for scanout.
    Submitted,
    /// There was nothing to draw.
    NoDamage,
    /// The frame was dropped and will never be presented.
    Aborted,
}

impl Backend {
    /// Sets up scanout for a new output.
    ///
    /// `page_flips` is handed to the driver side when the output reports page flips. Returns
    /// whether flips will be reported.
    pub fn add_output(
        &mut self,
        output: OutputId,
        name: &str,
        refresh_interval: Duration,
        page_flips: Option<PageFlipNotifier>,
    ) -> anyhow::Result<bool> {
        match self {
            Backend::Headless(headless) => {
                headless.add_output(output, name, refresh_interval, page_flips)
            }
        }
    }

    pub fn remove_output(&mut self, output: OutputId) {
        match self {
            Backend::Headless(headless) => headless.remove_output(output),
        }
    }

    pub fn render(&mut self, output: OutputId) -> RenderResult {
        match self {
            Backend::Headless(headless) => headless.render(output),
        }
    }

    pub fn headless(&mut self) -> &mut Headless {
        match self {
            Self::Headless(v) => v,
        }
    }
}
