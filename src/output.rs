//! Per-display geometry state.
//!
//! A [`DisplayOutput`] holds what clients currently see (the committed geometry, rotation and
//! ratio) and, while a change is in flight, the candidate it is moving to. Committed values only
//! change in [`DisplayOutput::finalize`].

use std::fmt;
use std::mem;
use std::time::Duration;

use smithay::utils::{Logical, Physical, Rectangle, Size, Transform};
use tvsync_config::GeometrySpec;

/// Stable identifier of a display output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u64);

impl OutputId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Output rotation in degrees, always a multiple of 90.
///
/// The raw value is kept as requested (270 and -90 are different requests), but everything
/// derived from it works modulo 360.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rotation(i32);

impl Rotation {
    pub const NORMAL: Self = Self(0);

    /// Rejects anything that is not a quarter turn.
    pub fn from_degrees(degrees: i32) -> Result<Self, OutputError> {
        if degrees % 90 != 0 {
            return Err(OutputError::InvalidRotation(degrees));
        }
        Ok(Self(degrees))
    }

    pub fn degrees(self) -> i32 {
        self.0
    }

    /// Whether width and height trade places relative to the base geometry.
    pub fn swaps_axes(self) -> bool {
        self.0 % 180 != 0
    }

    /// Transform reported to clients.
    pub fn transform(self) -> Transform {
        match self.0.rem_euclid(360) {
            90 => Transform::_90,
            180 => Transform::_180,
            270 => Transform::_270,
            _ => Transform::Normal,
        }
    }
}

/// Rejected geometry requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputError {
    InvalidRotation(i32),
    UnknownOutput(OutputId),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::InvalidRotation(degrees) => {
                write!(f, "invalid rotation {degrees}, must be a multiple of 90")
            }
            OutputError::UnknownOutput(id) => write!(f, "no output with id {}", id.get()),
        }
    }
}

impl std::error::Error for OutputError {}

/// Mode as advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputMode {
    /// Logical size scaled by the output ratio.
    pub size: Size<i32, Physical>,
    pub transform: Transform,
    /// Refresh rate in millihertz.
    pub refresh_mhz: u32,
}

/// Geometry an in-flight change is moving to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub geometry: Rectangle<i32, Logical>,
    pub rotation: Rotation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prepared {
    /// Nothing to do.
    Unchanged,
    /// A change is already in flight; the request replaced whatever was queued before.
    Queued { superseded: Option<Rotation> },
    /// Start a change towards this candidate.
    Change(Candidate),
}

/// Result of [`DisplayOutput::finalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Committed {
    pub mode: OutputMode,
    pub geometry_changed: bool,
    pub rotation_changed: bool,
    /// Rotation requested while the change was in flight; must be requested next.
    pub queued: Option<Rotation>,
}

/// Whether a geometry change is in progress.
#[derive(Debug, Default)]
enum Transition {
    #[default]
    Idle,
    InFlight {
        candidate: Candidate,
        /// Latest request that arrived meanwhile.
        queued: Option<Rotation>,
    },
}

#[derive(Debug)]
pub struct DisplayOutput {
    id: OutputId,
    name: String,
    /// Unrotated physical area.
    base_geometry: Rectangle<i32, Logical>,
    /// Committed geometry, base geometry rotated.
    geometry: Rectangle<i32, Logical>,
    rotation: Rotation,
    /// Logical to physical scale.
    ratio: f64,
    refresh_mhz: u32,
    /// How long a change waits for clients. Zero commits right away.
    transaction_timeout: Duration,
    transition: Transition,
}

impl DisplayOutput {
    /// Creates an idle output showing `spec` at its configured rotation.
    pub fn new(
        id: OutputId,
        name: impl Into<String>,
        spec: &GeometrySpec,
        refresh_mhz: u32,
        transaction_timeout: Duration,
    ) -> Self {
        let spec = spec.sanitized();
        let base_geometry = Rectangle::new((spec.x, spec.y).into(), (spec.width, spec.height).into());
        // Sanitizing already dropped invalid rotations.
        let rotation = Rotation::from_degrees(spec.rotation).unwrap_or(Rotation::NORMAL);

        let mut output = Self {
            id,
            name: name.into(),
            base_geometry,
            geometry: base_geometry,
            rotation,
            ratio: spec.ratio,
            refresh_mhz,
            transaction_timeout,
            transition: Transition::Idle,
        };
        output.geometry = output.candidate_for(rotation).geometry;
        output
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_geometry(&self) -> Rectangle<i32, Logical> {
        self.base_geometry
    }

    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        self.geometry
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn refresh_mhz(&self) -> u32 {
        self.refresh_mhz
    }

    /// Vsync interval derived from the refresh rate; 60 Hz when the rate is unknown.
    pub fn refresh_interval(&self) -> Duration {
        let mhz = if self.refresh_mhz == 0 {
            tvsync_config::DEFAULT_REFRESH_MHZ
        } else {
            self.refresh_mhz
        };
        Duration::from_nanos(1_000_000_000_000 / u64::from(mhz))
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// Takes effect from the next change; an open transaction keeps its deadline.
    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.transaction_timeout = timeout;
    }

    /// Whether a change is between [`begin`](Self::begin) and [`finalize`](Self::finalize).
    pub fn transaction_open(&self) -> bool {
        matches!(self.transition, Transition::InFlight { .. })
    }

    pub fn candidate(&self) -> Option<Candidate> {
        match self.transition {
            Transition::Idle => None,
            Transition::InFlight { candidate, .. } => Some(candidate),
        }
    }

    /// Rotation that will be requested once the current change commits.
    pub fn queued_rotation(&self) -> Option<Rotation> {
        match self.transition {
            Transition::Idle => None,
            Transition::InFlight { queued, .. } => queued,
        }
    }

    /// Mode clients currently see.
    pub fn mode(&self) -> OutputMode {
        self.mode_for(self.geometry, self.rotation)
    }

    /// Mode clients will see once the in-flight change commits.
    pub fn candidate_mode(&self) -> Option<OutputMode> {
        self.candidate()
            .map(|candidate| self.mode_for(candidate.geometry, candidate.rotation))
    }

    fn mode_for(&self, geometry: Rectangle<i32, Logical>, rotation: Rotation) -> OutputMode {
        OutputMode {
            size: geometry.size.to_f64().to_physical(self.ratio).to_i32_round(),
            transform: rotation.transform(),
            refresh_mhz: self.refresh_mhz,
        }
    }

    /// Geometry the output would have at `rotation`: the committed origin with the base size
    /// rotated.
    pub fn candidate_for(&self, rotation: Rotation) -> Candidate {
        Candidate {
            geometry: Rectangle::new(
                self.geometry.loc,
                rotation.transform().transform_size(self.base_geometry.size),
            ),
            rotation,
        }
    }

    /// Replaces the base geometry and ratio. The caller follows up with a forced change so that
    /// clients learn about it.
    pub fn set_base(&mut self, base_geometry: Rectangle<i32, Logical>, ratio: f64) {
        debug!(
            "{}: base geometry {:?} -> {:?}, ratio {} -> {ratio}",
            self.name, self.base_geometry, base_geometry, self.ratio
        );
        self.base_geometry = base_geometry;
        if ratio > 0. {
            self.ratio = ratio;
        } else {
            warn!("{}: ignoring invalid output ratio {ratio}", self.name);
        }
    }

    /// First half of a geometry change request.
    ///
    /// Validates the rotation, coalesces it if a change is already in flight, and otherwise
    /// computes the candidate.
    pub fn prepare_change(&mut self, degrees: i32, forced: bool) -> Result<Prepared, OutputError> {
        let rotation = Rotation::from_degrees(degrees)?;

        if let Transition::InFlight { queued, .. } = &mut self.transition {
            let superseded = queued.replace(rotation);
            return Ok(Prepared::Queued { superseded });
        }

        let candidate = self.candidate_for(rotation);
        if !forced && candidate.geometry == self.geometry && rotation == self.rotation {
            return Ok(Prepared::Unchanged);
        }

        Ok(Prepared::Change(candidate))
    }

    /// Whether committing `candidate` should wait for clients.
    pub fn needs_barrier(&self, candidate: &Candidate) -> bool {
        !self.transaction_timeout.is_zero()
            && candidate.rotation.swaps_axes() != self.rotation.swaps_axes()
    }

    /// Marks `candidate` as in flight. Committed values stay untouched until finalize.
    pub fn begin(&mut self, candidate: Candidate) {
        debug_assert!(!self.transaction_open());
        self.transition = Transition::InFlight {
            candidate,
            queued: None,
        };
    }

    /// Commits the in-flight candidate.
    ///
    /// Returns `None` if nothing was in flight.
    pub fn finalize(&mut self) -> Option<Committed> {
        let Transition::InFlight { candidate, queued } = mem::take(&mut self.transition) else {
            return None;
        };

        let geometry_changed = self.geometry != candidate.geometry;
        let rotation_changed = self.rotation != candidate.rotation;

        info!(
            "{}: applying output geometry {:?} -> {:?}, rotation {} -> {}",
            self.name,
            self.geometry,
            candidate.geometry,
            self.rotation.degrees(),
            candidate.rotation.degrees(),
        );

        self.geometry = candidate.geometry;
        self.rotation = candidate.rotation;

        Some(Committed {
            mode: self.mode(),
            geometry_changed,
            rotation_changed,
            queued,
        })
    }
}
