//! Client surfaces as far as output geometry and pacing are concerned.

use std::collections::BTreeMap;

use smithay::utils::{Logical, Size};

use crate::output::OutputId;
use crate::utils::id::IdCounter;

/// Unique surface identifier, never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A client surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    id: SurfaceId,
    /// Output the surface is shown on.
    output: OutputId,
    /// Size of the last committed buffer. Zero while unmapped.
    size: Size<i32, Logical>,
    minimized: bool,
}

impl Surface {
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn output(&self) -> OutputId {
        self.output
    }

    pub fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Whether the surface has to re-layout when the output width and height trade places.
    ///
    /// Minimized and unmapped surfaces are not on screen, and a square one looks the same
    /// either way.
    pub fn affected_by_axis_swap(&self) -> bool {
        !self.minimized && self.size.w > 0 && self.size.h > 0 && self.size.w != self.size.h
    }
}

/// All known surfaces, ordered by creation.
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    ids: IdCounter,
    surfaces: BTreeMap<SurfaceId, Surface>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new surface on `output`.
    pub fn add(&mut self, output: OutputId, size: Size<i32, Logical>) -> SurfaceId {
        let id = SurfaceId(self.ids.next());
        trace!("adding surface {} on output {}: {size:?}", id.get(), output.get());
        self.surfaces.insert(
            id,
            Surface {
                id,
                output,
                size,
                minimized: false,
            },
        );
        id
    }

    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        self.surfaces.remove(&id)
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    /// Records a new size. Returns whether the size actually changed, or `None` for an unknown
    /// surface.
    pub fn resize(&mut self, id: SurfaceId, size: Size<i32, Logical>) -> Option<bool> {
        let surface = self.surfaces.get_mut(&id)?;
        if surface.size == size {
            return Some(false);
        }
        surface.size = size;
        Some(true)
    }

    pub fn set_minimized(&mut self, id: SurfaceId, minimized: bool) -> Option<()> {
        self.surfaces.get_mut(&id)?.minimized = minimized;
        Some(())
    }

    /// Surfaces shown on `output`.
    pub fn on_output(&self, output: OutputId) -> impl Iterator<Item = &Surface> + '_ {
        self.surfaces.values().filter(move |s| s.output == output)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Surface> + '_ {
        self.surfaces.values()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_swap_filter() {
        let mut surfaces = SurfaceRegistry::new();
        let output = OutputId::new(1);
        let wide = surfaces.add(output, Size::from((800, 600)));
        let square = surfaces.add(output, Size::from((500, 500)));
        let unmapped = surfaces.add(output, Size::from((0, 0)));
        let minimized = surfaces.add(output, Size::from((800, 600)));
        surfaces.set_minimized(minimized, true).unwrap();

        let affected: Vec<_> = surfaces
            .on_output(output)
            .filter(|s| s.affected_by_axis_swap())
            .map(|s| s.id())
            .collect();
        assert_eq!(affected, vec![wide]);
        assert!(!surfaces.get(square).unwrap().affected_by_axis_swap());
        assert!(!surfaces.get(unmapped).unwrap().affected_by_axis_swap());
    }

    #[test]
    fn resize_reports_changes() {
        let mut surfaces = SurfaceRegistry::new();
        let id = surfaces.add(OutputId::new(1), Size::from((800, 600)));
        assert_eq!(surfaces.resize(id, Size::from((800, 600))), Some(false));
        assert_eq!(surfaces.resize(id, Size::from((600, 800))), Some(true));
        surfaces.remove(id).unwrap();
        assert_eq!(surfaces.resize(id, Size::from((1, 1))), None);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut surfaces = SurfaceRegistry::new();
        let a = surfaces.add(OutputId::new(1), Size::from((1, 2)));
        surfaces.remove(a);
        let b = surfaces.add(OutputId::new(1), Size::from((1, 2)));
        assert_ne!(a, b);
    }
}
