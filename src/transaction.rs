//! Barrier between requesting an output geometry change and committing it.
//!
//! When an output changes axis, every client surface on it has to re-layout. Committing the new
//! geometry right away would show a frame where clients still draw for the old aspect ratio, so
//! the commit waits until each affected surface has resized, or until a deadline passes.
//!
//! The coordinator only keeps the bookkeeping. The compositor registers the deadline timer,
//! routes surface events here and commits the geometry once a transaction is [`Closed`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use calloop::RegistrationToken;

use crate::output::OutputId;
use crate::surface::{Surface, SurfaceId};

/// Open geometry transactions, at most one per output.
#[derive(Debug, Default)]
pub struct RotationTransactionCoordinator {
    transactions: HashMap<OutputId, RotationTransaction>,
}

#[derive(Debug)]
struct RotationTransaction {
    /// Surfaces that have yet to acknowledge the new geometry.
    watch_set: HashSet<SurfaceId>,
    /// Size of the watch set when the transaction opened.
    watched: usize,
    opened_at: Duration,
    deadline: Deadline,
}

/// Deadline of a transaction: the timeout until the compositor inserts the timer, then its token.
#[derive(Debug)]
enum Deadline {
    NotRegistered(Duration),
    Registered(RegistrationToken),
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every watched surface resized or went away.
    Acknowledged,
    /// The deadline passed first. Clients will see one degraded frame.
    TimedOut { unacknowledged: usize },
}

/// A finished transaction. The caller commits the candidate geometry of `output`.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Closed {
    pub output: OutputId,
    pub completion: Completion,
    /// Time from opening to closing.
    pub elapsed: Duration,
    /// Deadline timer still registered with the event loop; the caller must remove it.
    pub timer: Option<RegistrationToken>,
}

impl RotationTransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction for `output` watching every affected surface in `surfaces`.
    ///
    /// Returns the number of watched surfaces. When nothing needs watching no transaction is
    /// recorded and the caller commits right away.
    pub fn open<'a>(
        &mut self,
        output: OutputId,
        surfaces: impl IntoIterator<Item = &'a Surface>,
        timeout: Duration,
        now: Duration,
    ) -> usize {
        if let Some(existing) = self.transactions.get(&output) {
            error!(
                "output {} already has a rotation transaction open, not opening another",
                output.get()
            );
            return existing.watch_set.len();
        }

        let watch_set: HashSet<_> = surfaces
            .into_iter()
            .filter(|s| s.output() == output && s.affected_by_axis_swap())
            .map(|s| s.id())
            .collect();

        let watched = watch_set.len();
        if watched == 0 {
            trace!("output {}: no surfaces to wait for", output.get());
            return 0;
        }

        debug!(
            "output {}: waiting for {watched} surfaces to resize, timeout {timeout:?}",
            output.get()
        );

        self.transactions.insert(
            output,
            RotationTransaction {
                watch_set,
                watched,
                opened_at: now,
                deadline: Deadline::NotRegistered(timeout),
            },
        );

        watched
    }

    /// Timeout of a transaction whose deadline timer is not registered yet.
    pub fn pending_deadline(&self, output: OutputId) -> Option<Duration> {
        match self.transactions.get(&output)?.deadline {
            Deadline::NotRegistered(timeout) => Some(timeout),
            Deadline::Registered(_) => None,
        }
    }

    /// Attaches the inserted deadline timer so it can be removed on early close.
    pub fn set_deadline_timer(&mut self, output: OutputId, token: RegistrationToken) {
        let Some(transaction) = self.transactions.get_mut(&output) else {
            error!(
                "output {} has no rotation transaction to attach a timer to",
                output.get()
            );
            return;
        };
        transaction.deadline = Deadline::Registered(token);
    }

    /// Records that `surface` resized. Closes its transaction if it was the last one pending.
    pub fn acknowledge(&mut self, surface: SurfaceId, now: Duration) -> Option<Closed> {
        self.release(surface, now, "resized")
    }

    /// Drops a destroyed surface from whatever transaction watches it.
    pub fn forget_surface(&mut self, surface: SurfaceId, now: Duration) -> Option<Closed> {
        self.release(surface, now, "destroyed")
    }

    fn release(&mut self, surface: SurfaceId, now: Duration, why: &str) -> Option<Closed> {
        let (&output, transaction) = self
            .transactions
            .iter_mut()
            .find(|(_, t)| t.watch_set.contains(&surface))?;

        transaction.watch_set.remove(&surface);
        trace!(
            "output {}: surface {} {why}, {} of {} remaining",
            output.get(),
            surface.get(),
            transaction.watch_set.len(),
            transaction.watched
        );

        if !transaction.watch_set.is_empty() {
            return None;
        }

        // Last one out closes the transaction.
        let transaction = self.transactions.remove(&output)?;
        Some(transaction.close(output, Completion::Acknowledged, now))
    }

    /// Called when the deadline timer fires.
    ///
    /// The timer source removes itself, so the returned [`Closed`] carries no token.
    pub fn expire(&mut self, output: OutputId, now: Duration) -> Option<Closed> {
        let mut transaction = self.transactions.remove(&output)?;
        let unacknowledged = transaction.watch_set.len();
        transaction.deadline = Deadline::NotRegistered(Duration::ZERO);

        warn!(
            "output {}: {unacknowledged} of {} surfaces did not resize in time, \
             committing geometry anyway",
            output.get(),
            transaction.watched
        );

        Some(transaction.close(output, Completion::TimedOut { unacknowledged }, now))
    }

    /// Drops the transaction of a removed output without committing anything.
    pub fn cancel(&mut self, output: OutputId) -> Option<RegistrationToken> {
        match self.transactions.remove(&output)?.deadline {
            Deadline::NotRegistered(_) => None,
            Deadline::Registered(token) => Some(token),
        }
    }

    /// Whether `output` is waiting for clients.
    pub fn is_open(&self, output: OutputId) -> bool {
        self.transactions.contains_key(&output)
    }

    /// Number of watched surfaces that have not acknowledged yet.
    pub fn remaining(&self, output: OutputId) -> Option<usize> {
        self.transactions.get(&output).map(|t| t.watch_set.len())
    }

    /// Whether some open transaction still waits for `surface`.
    pub fn is_watched(&self, surface: SurfaceId) -> bool {
        self.transactions
            .values()
            .any(|t| t.watch_set.contains(&surface))
    }
}

impl RotationTransaction {
    fn close(self, output: OutputId, completion: Completion, now: Duration) -> Closed {
        let timer = match self.deadline {
            Deadline::NotRegistered(_) => None,
            Deadline::Registered(token) => Some(token),
        };

        Closed {
            output,
            completion,
            elapsed: now.saturating_sub(self.opened_at),
            timer,
        }
    }
}

#[cfg(test)]
mod tests {
    use smithay::utils::Size;

    use super::*;
    use crate::surface::SurfaceRegistry;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn setup() -> (SurfaceRegistry, OutputId, Vec<SurfaceId>) {
        let mut surfaces = SurfaceRegistry::new();
        let output = OutputId::new(1);
        let ids = vec![
            surfaces.add(output, Size::from((800, 600))),
            surfaces.add(output, Size::from((640, 480))),
            // Square surfaces never need to re-layout.
            surfaces.add(output, Size::from((500, 500))),
            // Surfaces on other outputs are not affected.
            surfaces.add(OutputId::new(2), Size::from((800, 600))),
        ];
        (surfaces, output, ids)
    }

    #[test]
    fn closes_after_last_acknowledgement() {
        let (surfaces, output, ids) = setup();
        let mut coordinator = RotationTransactionCoordinator::new();

        let watched = coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO);
        assert_eq!(watched, 2);
        assert!(coordinator.is_open(output));
        assert_eq!(coordinator.pending_deadline(output), Some(TIMEOUT));
        assert!(!coordinator.is_watched(ids[2]));
        assert!(!coordinator.is_watched(ids[3]));

        assert_eq!(coordinator.acknowledge(ids[3], Duration::ZERO), None);
        assert_eq!(coordinator.acknowledge(ids[0], Duration::ZERO), None);
        // A repeated acknowledgement does not count twice.
        assert_eq!(coordinator.acknowledge(ids[0], Duration::ZERO), None);
        assert_eq!(coordinator.remaining(output), Some(1));

        let closed = coordinator
            .acknowledge(ids[1], Duration::from_millis(30))
            .unwrap();
        assert_eq!(closed.output, output);
        assert_eq!(closed.completion, Completion::Acknowledged);
        assert_eq!(closed.elapsed, Duration::from_millis(30));
        assert!(!coordinator.is_open(output));
        assert_eq!(coordinator.remaining(output), None);
    }

    #[test]
    fn empty_watch_set_records_nothing() {
        let mut surfaces = SurfaceRegistry::new();
        let output = OutputId::new(1);
        surfaces.add(output, Size::from((500, 500)));
        let minimized = surfaces.add(output, Size::from((800, 600)));
        surfaces.set_minimized(minimized, true).unwrap();

        let mut coordinator = RotationTransactionCoordinator::new();
        assert_eq!(
            coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO),
            0
        );
        assert!(!coordinator.is_open(output));
        assert_eq!(coordinator.pending_deadline(output), None);
    }

    #[test]
    fn destroyed_surface_releases_its_slot() {
        let (surfaces, output, ids) = setup();
        let mut coordinator = RotationTransactionCoordinator::new();
        coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO);

        assert_eq!(coordinator.forget_surface(ids[0], Duration::ZERO), None);
        let closed = coordinator.forget_surface(ids[1], Duration::ZERO).unwrap();
        assert_eq!(closed.completion, Completion::Acknowledged);
    }

    #[test]
    fn expiry_reports_stragglers() {
        let (surfaces, output, ids) = setup();
        let mut coordinator = RotationTransactionCoordinator::new();
        coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO);
        assert_eq!(coordinator.acknowledge(ids[0], Duration::ZERO), None);

        let closed = coordinator.expire(output, TIMEOUT).unwrap();
        assert_eq!(
            closed.completion,
            Completion::TimedOut { unacknowledged: 1 }
        );
        assert_eq!(closed.timer, None);
        assert_eq!(closed.elapsed, TIMEOUT);

        // Late acknowledgements and repeated expiry are no-ops.
        assert_eq!(coordinator.acknowledge(ids[1], TIMEOUT), None);
        assert_eq!(coordinator.expire(output, TIMEOUT), None);
    }

    #[test]
    fn reopening_keeps_the_first_transaction() {
        let (surfaces, output, ids) = setup();
        let mut coordinator = RotationTransactionCoordinator::new();
        coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO);
        assert_eq!(coordinator.acknowledge(ids[0], Duration::ZERO), None);

        assert_eq!(
            coordinator.open(output, surfaces.iter(), TIMEOUT, Duration::ZERO),
            1
        );
        assert_eq!(coordinator.remaining(output), Some(1));
    }

    #[test]
    fn transactions_are_per_output() {
        let mut surfaces = SurfaceRegistry::new();
        let first = OutputId::new(1);
        let second = OutputId::new(2);
        let a = surfaces.add(first, Size::from((800, 600)));
        let b = surfaces.add(second, Size::from((800, 600)));

        let mut coordinator = RotationTransactionCoordinator::new();
        coordinator.open(first, surfaces.iter(), TIMEOUT, Duration::ZERO);
        coordinator.open(second, surfaces.iter(), TIMEOUT, Duration::ZERO);

        let closed = coordinator.acknowledge(b, Duration::ZERO).unwrap();
        assert_eq!(closed.output, second);
        assert!(coordinator.is_open(first));
        assert_eq!(coordinator.cancel(first), None);
        assert!(!coordinator.is_watched(a));
    }
}
