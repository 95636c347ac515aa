//! Delivery of page flip notifications from the display driver thread to the compositor loop.
//!
//! Drivers report flips on their own thread. [`PageFlipNotifier`] is the only thing that crosses
//! over: it queues a [`PageFlip`] onto a calloop channel and wakes the loop, which then hands the
//! notification to the frame pacer of the right output. Pacing state never leaves the loop
//! thread, and notifications are delivered in the order they were sent.

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use calloop::channel::{self, Channel, Event, Sender};
use calloop::{LoopHandle, RegistrationToken};

use crate::output::OutputId;

/// One completed scanout on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlip {
    pub output: OutputId,
    /// Hardware frame sequence number. Zero means the driver did not report one.
    pub sequence: u32,
    /// Monotonic time of the vblank.
    pub timestamp: Duration,
}

impl PageFlip {
    /// Builds a notification from the seconds and microseconds pair drivers report.
    pub fn from_timeval(output: OutputId, sequence: u32, tv_sec: u32, tv_usec: u32) -> Self {
        Self {
            output,
            sequence,
            timestamp: Duration::from_secs(u64::from(tv_sec))
                + Duration::from_micros(u64::from(tv_usec)),
        }
    }
}

/// Sending half of the bridge. Cheap to clone and safe to move to driver threads.
#[derive(Clone)]
pub struct PageFlipNotifier {
    sender: Sender<PageFlip>,
}

impl fmt::Debug for PageFlipNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFlipNotifier").finish_non_exhaustive()
    }
}

/// The loop side of the bridge was dropped. Carries the undelivered flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected(pub PageFlip);

impl fmt::Display for Disconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "compositor loop is gone, dropping page flip {} for output {}",
            self.0.sequence,
            self.0.output.get()
        )
    }
}

impl std::error::Error for Disconnected {}

impl PageFlipNotifier {
    /// Queues `flip` for the loop thread. Never blocks.
    pub fn notify(&self, flip: PageFlip) -> Result<(), Disconnected> {
        self.sender.send(flip).map_err(|_| Disconnected(flip))
    }
}

/// Creates an unregistered bridge. Most callers want [`insert_page_flip_source`].
pub fn page_flip_channel() -> (PageFlipNotifier, Channel<PageFlip>) {
    let (sender, channel) = channel::channel();
    (PageFlipNotifier { sender }, channel)
}

/// Registers the receiving half with the event loop.
///
/// `on_flip` runs on the loop thread for every notification, in send order.
pub fn insert_page_flip_source<D: 'static>(
    event_loop: &LoopHandle<'static, D>,
    mut on_flip: impl FnMut(PageFlip, &mut D) + 'static,
) -> anyhow::Result<(PageFlipNotifier, RegistrationToken)> {
    let (notifier, channel) = page_flip_channel();

    let token = event_loop
        .insert_source(channel, move |event, _, data| match event {
            Event::Msg(flip) => {
                let _span = tracy_client::span!("page flip");
                on_flip(flip, data);
            }
            Event::Closed => debug!("all page flip notifiers dropped"),
        })
        .map_err(|err| anyhow!("error inserting page flip source: {}", err.error))?;

    Ok((notifier, token))
}
