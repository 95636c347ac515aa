use std::thread;
use std::time::Duration;

use smithay::utils::{Rectangle, Size, Transform};
use tvsync_config::Config;

use super::fixture::Fixture;
use crate::compositor::{GeometryRequest, OutputEvent};
use crate::output::{OutputError, OutputId, Rotation};

fn mode_changes(events: &[OutputEvent]) -> Vec<(Size<i32, smithay::utils::Physical>, Transform)> {
    events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::ModeChanged { mode, .. } => Some((mode.size, mode.transform)),
            _ => None,
        })
        .collect()
}

fn rotation(f: &Fixture, output: OutputId) -> i32 {
    f.state.tvsync.output(output).unwrap().rotation().degrees()
}

#[test]
fn commit_waits_for_every_surface() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    let first = f.add_surface(output, 800, 600);
    let second = f.add_surface(output, 640, 480);

    let res = f.state.tvsync.request_geometry_change(output, 90, false);
    assert_eq!(res, Ok(GeometryRequest::Pending { watched: 2 }));
    assert!(f.state.tvsync.rotation.is_open(output));

    let events = f.events();
    assert!(matches!(
        events.as_slice(),
        [OutputEvent::GeometryPending { watched: 2, mode, .. }]
            if mode.size == Size::from((1080, 1920)) && mode.transform == Transform::_90
    ));

    // Nothing is committed while clients are still drawing for the old geometry.
    f.resize(first, 600, 800);
    assert_eq!(rotation(&f, output), 0);
    assert!(f.events().is_empty());

    f.resize(second, 480, 640);
    assert_eq!(rotation(&f, output), 90);
    assert!(!f.state.tvsync.rotation.is_open(output));
    assert!(!f.state.tvsync.output(output).unwrap().transaction_open());

    let events = f.events();
    assert_eq!(
        mode_changes(&events),
        [(Size::from((1080, 1920)), Transform::_90)]
    );
    assert_eq!(events.len(), 1);
}

#[test]
fn empty_watch_set_commits_synchronously() {
    let mut f = Fixture::new();
    let output = f.add_output("A");

    let res = f.state.tvsync.request_geometry_change(output, 270, false);
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(rotation(&f, output), 270);
    assert!(!f.state.tvsync.rotation.is_open(output));
    assert_eq!(
        mode_changes(&f.events()),
        [(Size::from((1080, 1920)), Transform::_270)]
    );
}

#[test]
fn unaffected_surfaces_are_not_waited_for() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    let other = f.add_output("B");
    f.add_surface(output, 500, 500);
    let minimized = f.add_surface(output, 800, 600);
    f.state.tvsync.set_surface_minimized(minimized, true);
    f.add_surface(other, 800, 600);

    let res = f.state.tvsync.request_geometry_change(output, 90, false);
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(rotation(&f, output), 90);
}

#[test]
fn same_axis_rotation_skips_the_barrier() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    f.add_surface(output, 800, 600);

    let res = f.state.tvsync.request_geometry_change(output, 180, false);
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(
        mode_changes(&f.events()),
        [(Size::from((1920, 1080)), Transform::_180)]
    );
}

#[test]
fn zero_timeout_disables_the_barrier() {
    let mut config = Config::default();
    config.rotation.timeout_ms = 0;
    let mut f = Fixture::with_config(config);
    let output = f.add_output("A");
    f.add_surface(output, 800, 600);

    let res = f.state.tvsync.request_geometry_change(output, 90, false);
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(rotation(&f, output), 90);
}

#[test]
fn per_output_timeout_overrides_default() {
    let mut f = Fixture::new();
    let mut config = tvsync_config::Output::new("A");
    config.rotation_timeout_ms = Some(0);
    let output = f.add_output_with(config);
    f.add_surface(output, 800, 600);

    let res = f.state.tvsync.request_geometry_change(output, 90, false);
    assert_eq!(res, Ok(GeometryRequest::Committed));
}

#[test]
fn invalid_rotation_changes_nothing() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    f.add_surface(output, 800, 600);

    let res = f.state.tvsync.request_geometry_change(output, 45, false);
    assert_eq!(res, Err(OutputError::InvalidRotation(45)));
    assert_eq!(rotation(&f, output), 0);
    assert!(!f.state.tvsync.rotation.is_open(output));
    assert!(f.events().is_empty());
}

#[test]
fn unknown_output() {
    let mut f = Fixture::new();
    let missing = OutputId::new(99);
    assert_eq!(
        f.state.tvsync.request_geometry_change(missing, 90, false),
        Err(OutputError::UnknownOutput(missing))
    );
}

#[test]
fn unchanged_request_is_a_no_op_unless_forced() {
    let mut f = Fixture::new();
    let output = f.add_output("A");

    let res = f.state.tvsync.request_geometry_change(output, 0, false);
    assert_eq!(res, Ok(GeometryRequest::Unchanged));
    assert!(f.events().is_empty());

    let res = f.state.tvsync.request_geometry_change(output, 0, true);
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(
        mode_changes(&f.events()),
        [(Size::from((1920, 1080)), Transform::Normal)]
    );
}

#[test]
fn requests_during_a_transaction_coalesce() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    let first = f.add_surface(output, 800, 600);
    let second = f.add_surface(output, 640, 480);

    assert_eq!(
        f.state.tvsync.request_geometry_change(output, 90, false),
        Ok(GeometryRequest::Pending { watched: 2 })
    );
    assert_eq!(
        f.state.tvsync.request_geometry_change(output, 180, false),
        Ok(GeometryRequest::Queued)
    );
    assert_eq!(
        f.state.tvsync.request_geometry_change(output, 0, false),
        Ok(GeometryRequest::Queued)
    );
    let display = f.state.tvsync.output(output).unwrap();
    assert_eq!(display.candidate().unwrap().rotation.degrees(), 90);
    assert_eq!(display.queued_rotation(), Some(Rotation::NORMAL));
    f.events();

    f.resize(first, 600, 800);
    f.resize(second, 480, 640);

    // 90 is committed, and the last queued request immediately opens the next transaction.
    assert_eq!(rotation(&f, output), 90);
    let display = f.state.tvsync.output(output).unwrap();
    assert_eq!(display.candidate().unwrap().rotation.degrees(), 0);
    assert_eq!(display.queued_rotation(), None);
    assert_eq!(f.state.tvsync.rotation.remaining(output), Some(2));

    f.resize(first, 800, 600);
    f.resize(second, 640, 480);
    assert_eq!(rotation(&f, output), 0);

    let events = f.events();
    assert_eq!(
        mode_changes(&events),
        [
            (Size::from((1080, 1920)), Transform::_90),
            (Size::from((1920, 1080)), Transform::Normal),
        ]
    );
    // 180 was superseded before it ever became a candidate.
    assert!(!events.iter().any(|event| matches!(
        event,
        OutputEvent::GeometryPending { mode, .. } | OutputEvent::ModeChanged { mode, .. }
            if mode.transform == Transform::_180
    )));
}

#[test]
fn destroyed_surface_releases_the_barrier() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    let first = f.add_surface(output, 800, 600);
    let second = f.add_surface(output, 640, 480);

    f.state
        .tvsync
        .request_geometry_change(output, 90, false)
        .unwrap();
    f.resize(first, 600, 800);
    f.state.tvsync.surface_destroyed(second);

    assert_eq!(rotation(&f, output), 90);
    assert!(!f.state.tvsync.rotation.is_open(output));
}

#[test]
fn same_size_resize_does_not_acknowledge() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    let surface = f.add_surface(output, 800, 600);

    f.state
        .tvsync
        .request_geometry_change(output, 90, false)
        .unwrap();
    f.resize(surface, 800, 600);
    assert!(f.state.tvsync.rotation.is_open(output));

    f.resize(surface, 600, 800);
    assert!(!f.state.tvsync.rotation.is_open(output));
}

#[test]
fn deadline_commits_without_stragglers() {
    let mut config = Config::default();
    config.rotation.timeout_ms = 20;
    let mut f = Fixture::with_config(config);
    let output = f.add_output("A");
    let first = f.add_surface(output, 800, 600);
    f.add_surface(output, 640, 480);

    f.state
        .tvsync
        .request_geometry_change(output, 90, false)
        .unwrap();
    f.resize(first, 600, 800);
    f.events();

    assert!(f.dispatch_until(Duration::from_secs(2), |state| {
        !state.tvsync.rotation.is_open(output)
    }));
    assert_eq!(rotation(&f, output), 90);
    assert_eq!(
        mode_changes(&f.events()),
        [(Size::from((1080, 1920)), Transform::_90)]
    );
}

#[test]
fn acknowledged_transaction_cancels_its_deadline() {
    let mut config = Config::default();
    config.rotation.timeout_ms = 200;
    let mut f = Fixture::with_config(config);
    let output = f.add_output("A");
    let surface = f.add_surface(output, 800, 600);

    f.state
        .tvsync
        .request_geometry_change(output, 90, false)
        .unwrap();
    f.resize(surface, 600, 800);
    assert_eq!(rotation(&f, output), 90);

    thread::sleep(Duration::from_millis(150));

    // A second change on the same output must not be cut short by the first deadline.
    f.state
        .tvsync
        .request_geometry_change(output, 0, false)
        .unwrap();
    f.dispatch_until(Duration::from_millis(100), |_| false);
    assert!(f.state.tvsync.rotation.is_open(output));
    assert_eq!(rotation(&f, output), 90);
}

#[test]
fn base_geometry_change_resends_mode() {
    let mut f = Fixture::new();
    let output = f.add_output("A");

    let res = f.state.tvsync.set_base_geometry(
        output,
        Rectangle::new((0, 0).into(), (1280, 720).into()),
        0,
        1.5,
    );
    assert_eq!(res, Ok(GeometryRequest::Committed));
    assert_eq!(
        mode_changes(&f.events()),
        [(Size::from((1920, 1080)), Transform::Normal)]
    );
    assert_eq!(
        f.state.tvsync.output(output).unwrap().geometry().size,
        Size::from((1280, 720))
    );
}

#[test]
fn removing_an_output_drops_its_transaction() {
    let mut f = Fixture::new();
    let output = f.add_output("A");
    f.add_surface(output, 800, 600);

    f.state
        .tvsync
        .request_geometry_change(output, 90, false)
        .unwrap();
    f.state.remove_output(output);
    assert!(!f.state.tvsync.rotation.is_open(output));
    assert!(f.state.tvsync.output(output).is_none());
}
