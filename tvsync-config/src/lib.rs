//! Configuration of the tvsync output pipeline.
//!
//! The document is KDL. Every tunable the pacing and rotation code reads at runtime lives here,
//! so nothing downstream needs to consult the environment or process-wide state.

#[macro_use]
extern crate tracing;

use std::ffi::OsStr;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use miette::{miette, Context, IntoDiagnostic};
use regex::Regex;

pub const DEFAULT_REFRESH_MHZ: u32 = 60_000;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(children(name = "output"))]
    pub outputs: Vec<Output>,
    #[knuffel(child, default)]
    pub pacing: Pacing,
    #[knuffel(child, default)]
    pub rotation: Rotation,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Output {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(child, unwrap(argument, str), default)]
    pub geometry: GeometrySpec,
    #[knuffel(child, unwrap(argument), default = DEFAULT_REFRESH_MHZ)]
    pub refresh_mhz: u32,
    /// Overrides `rotation { timeout-ms }` for this output.
    #[knuffel(child, unwrap(argument))]
    pub rotation_timeout_ms: Option<u32>,
    /// The display driver does not report page flips for this output.
    #[knuffel(child)]
    pub without_page_flip: bool,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    #[knuffel(child)]
    pub disable_adaptive_update: bool,
    #[knuffel(child)]
    pub adaptive_frame_callback: bool,
    /// Pace outputs without a page flip notifier from measured render time.
    #[knuffel(child)]
    pub estimate_without_page_flip: bool,
    #[knuffel(child, unwrap(argument), default = Self::default().default_idle_ms)]
    pub default_idle_ms: u32,
    #[knuffel(child, unwrap(argument), default = Self::default().max_idle_ms)]
    pub max_idle_ms: u32,
    /// Consecutive on-time page flips before the idle time grows by one millisecond.
    #[knuffel(child, unwrap(argument), default = Self::default().on_time_threshold)]
    pub on_time_threshold: u32,
    /// Idle time between updates for outputs without adaptive pacing.
    #[knuffel(child, unwrap(argument), default = Self::default().fixed_idle_ms)]
    pub fixed_idle_ms: u32,
    #[knuffel(child, unwrap(argument), default = Self::default().render_fluctuation_buffer_ms)]
    pub render_fluctuation_buffer_ms: u32,
    #[knuffel(child, unwrap(argument), default = Self::default().static_swap_buffer_ms)]
    pub static_swap_buffer_ms: u32,
    #[knuffel(child, unwrap(argument), default = Self::default().frame_callback_max_step_ms)]
    pub frame_callback_max_step_ms: u32,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            disable_adaptive_update: false,
            adaptive_frame_callback: false,
            estimate_without_page_flip: false,
            // Roughly a 60 Hz vsync minus ~3 ms update-to-swap and ~5 ms swap-to-scanout.
            default_idle_ms: 8,
            max_idle_ms: 8,
            on_time_threshold: 30,
            fixed_idle_ms: 5,
            render_fluctuation_buffer_ms: 4,
            static_swap_buffer_ms: 2,
            frame_callback_max_step_ms: 1,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Zero disables waiting for clients altogether.
    #[knuffel(child, unwrap(argument), default = Self::default().timeout_ms)]
    pub timeout_ms: u32,
}

impl Default for Rotation {
    fn default() -> Self {
        Self { timeout_ms: 1500 }
    }
}

static GEOMETRY: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Output geometry as written in `WIDTHxHEIGHT(+|-)X(+|-)YrROTATIONsRATIO` form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometrySpec {
    pub width: i32,
    pub height: i32,
    pub x: i32,
    pub y: i32,
    pub rotation: i32,
    pub ratio: f64,
}

impl Default for GeometrySpec {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            x: 0,
            y: 0,
            rotation: 0,
            ratio: 1.,
        }
    }
}

impl FromStr for GeometrySpec {
    type Err = miette::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = GEOMETRY
            .get_or_init(|| {
                Regex::new(r"^([0-9]+)x([0-9]+)([+-][0-9]+)([+-][0-9]+)r([0-9]+)s([0-9]+\.?[0-9]*)$")
            })
            .as_ref()
            .map_err(|err| miette!("error compiling the geometry pattern: {err}"))?;
        let caps = re
            .captures(s)
            .ok_or_else(|| miette!("invalid geometry {s:?}, expected e.g. 1920x1080+0+0r0s1"))?;

        let int = |i: usize| -> Result<i32, miette::Error> {
            caps[i]
                .parse()
                .map_err(|err| miette!("invalid number in geometry {s:?}: {err}"))
        };

        let ratio: f64 = caps[6]
            .parse()
            .map_err(|err| miette!("invalid ratio in geometry {s:?}: {err}"))?;

        let spec = Self {
            width: int(1)?,
            height: int(2)?,
            x: int(3)?,
            y: int(4)?,
            rotation: int(5)?,
            ratio,
        };
        Ok(spec.sanitized())
    }
}

impl GeometrySpec {
    /// Replaces values the output cannot use with safe fallbacks.
    pub fn sanitized(mut self) -> Self {
        if self.rotation % 90 != 0 {
            warn!(
                "invalid output rotation {} in geometry, falling back to 0",
                self.rotation
            );
            self.rotation = 0;
        }
        if !(self.ratio > 0.) {
            warn!(
                "invalid output ratio {} in geometry, falling back to 1",
                self.ratio
            );
            self.ratio = 1.;
        }
        self
    }
}

impl Output {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            geometry: GeometrySpec::default(),
            refresh_mhz: DEFAULT_REFRESH_MHZ,
            rotation_timeout_ms: None,
            without_page_flip: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let _span = tracy_client::span!("Config::load");
        Self::load_internal(path).context("error loading config")
    }

    fn load_internal(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("config.kdl"),
            &contents,
        )
        .context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    /// Rotation barrier timeout for the named output, in milliseconds.
    pub fn rotation_timeout_ms(&self, output: &str) -> u32 {
        self.outputs
            .iter()
            .find(|o| o.name == output)
            .and_then(|o| o.rotation_timeout_ms)
            .unwrap_or(self.rotation.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn do_parse(text: &str) -> Config {
        Config::parse("test.kdl", text)
            .map_err(miette::Report::new)
            .unwrap()
    }

    #[test]
    fn parse_full() {
        let parsed = do_parse(
            r#"
            output "HDMI-A-1" {
                geometry "1080x1920+0-40r90s1.5"
                refresh-mhz 50000
                rotation-timeout-ms 300
            }

            output "HDMI-A-2" {
                without-page-flip
            }

            pacing {
                adaptive-frame-callback
                default-idle-ms 6
                max-idle-ms 9
                on-time-threshold 12
                render-fluctuation-buffer-ms 3
            }

            rotation {
                timeout-ms 2000
            }
            "#,
        );

        assert_eq!(parsed.outputs.len(), 2);

        let first = &parsed.outputs[0];
        assert_eq!(first.name, "HDMI-A-1");
        assert_eq!(
            first.geometry,
            GeometrySpec {
                width: 1080,
                height: 1920,
                x: 0,
                y: -40,
                rotation: 90,
                ratio: 1.5,
            }
        );
        assert_eq!(first.refresh_mhz, 50_000);
        assert_eq!(first.rotation_timeout_ms, Some(300));
        assert!(!first.without_page_flip);

        let second = &parsed.outputs[1];
        assert_eq!(second.geometry, GeometrySpec::default());
        assert_eq!(second.refresh_mhz, DEFAULT_REFRESH_MHZ);
        assert!(second.without_page_flip);

        assert_eq!(
            parsed.pacing,
            Pacing {
                adaptive_frame_callback: true,
                default_idle_ms: 6,
                max_idle_ms: 9,
                on_time_threshold: 12,
                render_fluctuation_buffer_ms: 3,
                ..Pacing::default()
            }
        );

        assert_eq!(parsed.rotation.timeout_ms, 2000);
        assert_eq!(parsed.rotation_timeout_ms("HDMI-A-1"), 300);
        assert_eq!(parsed.rotation_timeout_ms("HDMI-A-2"), 2000);
        assert_eq!(parsed.rotation_timeout_ms("missing"), 2000);
    }

    #[test]
    fn parse_empty_uses_defaults() {
        let parsed = do_parse("");
        assert_eq!(parsed, Config::default());
        assert_eq!(parsed.pacing.default_idle_ms, 8);
        assert_eq!(parsed.rotation.timeout_ms, 1500);
    }

    #[test]
    fn parse_rejects_bad_geometry() {
        let res = Config::parse(
            "test.kdl",
            r#"output "A" { geometry "1920by1080"; }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn geometry_spec() {
        let spec: GeometrySpec = "1280x720-10+20r270s2".parse().unwrap();
        assert_eq!(spec.width, 1280);
        assert_eq!(spec.height, 720);
        assert_eq!(spec.x, -10);
        assert_eq!(spec.y, 20);
        assert_eq!(spec.rotation, 270);
        assert_eq!(spec.ratio, 2.);

        assert!("1280x720".parse::<GeometrySpec>().is_err());
        assert!("1280x720+0+0r90".parse::<GeometrySpec>().is_err());
        assert!(" 1280x720+0+0r90s1".parse::<GeometrySpec>().is_err());
    }

    #[test]
    fn geometry_pattern_is_shared_across_parses() {
        let first: GeometrySpec = "800x600+0+0r0s1".parse().unwrap();
        assert!("800x600".parse::<GeometrySpec>().is_err());
        let second: GeometrySpec = "600x800+5+5r90s1".parse().unwrap();
        assert_eq!((first.width, second.width), (800, 600));
        assert!(GEOMETRY.get().is_some_and(|re| re.is_ok()));
    }

    #[test]
    fn geometry_spec_fallbacks() {
        let spec: GeometrySpec = "1920x1080+0+0r45s0".parse().unwrap();
        assert_eq!(spec.rotation, 0);
        assert_eq!(spec.ratio, 1.);
    }
}
