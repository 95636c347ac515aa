#[macro_use]
extern crate tracing;

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use std::{env, io};

use anyhow::Context;
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use clap::Parser;
use directories::ProjectDirs;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tvsync::backend::headless::FlipMode;
use tvsync::backend::{Backend, Headless};
use tvsync::cli::{Cli, Sub};
use tvsync::clients::SyntheticClients;
use tvsync::compositor::{OutputPacing, State};
use tvsync::frame_pacer::FrameStats;
use tvsync::utils::clock::Clock;
use tvsync::utils::version;
use tvsync::utils::watcher::Watcher;
use tvsync_config::Config;

const DEFAULT_LOG_FILTER: &str = "tvsync=debug";

#[derive(Serialize)]
struct OutputReport {
    name: String,
    pacing: &'static str,
    rotation: i32,
    width: i32,
    height: i32,
    update_interval_ms: Option<u32>,
    frame_interval_ms: Option<u32>,
    renders: u64,
    stats: Option<FrameStats>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("RUST_BACKTRACE").is_none() {
        env::set_var("RUST_BACKTRACE", "1");
    }

    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    if let Some(subcommand) = cli.subcommand {
        match subcommand {
            Sub::Validate { config } => {
                tracy_client::Client::start();

                let (path, _) = config_path(config);
                Config::load(&path)?;
                info!("config is valid");
                return Ok(());
            }
        }
    }

    tracy_client::Client::start();

    info!("starting version {}", &version());

    let (path, watch_path) = config_path(cli.config);
    env::remove_var("TVSYNC_CONFIG");

    let mut config = if path.exists() {
        Config::load(&path)
            .map_err(|err| warn!("{err:?}"))
            .unwrap_or_default()
    } else {
        info!("no config at {path:?}, using defaults");
        Config::default()
    };
    if config.outputs.is_empty() {
        config.outputs.push(tvsync_config::Output::new("headless-1"));
    }
    let outputs = config.outputs.clone();

    let mut event_loop = EventLoop::try_new().context("error creating event loop")?;
    let backend = Backend::Headless(Headless::new(FlipMode::Simulated));
    let mut state = State::new(
        config,
        event_loop.handle(),
        event_loop.get_signal(),
        backend,
        Clock::default(),
    )?;

    for output in &outputs {
        state.add_output(output)?;
    }

    let _watcher = {
        let process = |path: &Path| {
            Config::load(path).map_err(|err| {
                warn!("{:?}", err.context("error loading config"));
            })
        };

        let (tx, rx) = calloop::channel::sync_channel(1);
        let watcher = Watcher::new(watch_path, process, tx)?;
        event_loop
            .handle()
            .insert_source(rx, |event, _, state| match event {
                calloop::channel::Event::Msg(Ok(config)) => state.reload_config(config),
                calloop::channel::Event::Msg(Err(())) | calloop::channel::Event::Closed => (),
            })
            .map_err(|err| anyhow::anyhow!("error inserting config watcher: {}", err.error))?;
        watcher
    };

    let clients = SyntheticClients::spawn(
        &mut state,
        cli.clients,
        Duration::from_millis(cli.client_render_ms),
        Duration::from_millis(cli.client_resize_ms),
    );
    clients.start(&mut state);

    if let Some(secs) = cli.rotate_every.filter(|secs| *secs > 0) {
        let every = Duration::from_secs(secs);
        let rotations = Rc::new(Cell::new(0));
        event_loop
            .handle()
            .insert_source(Timer::from_duration(every), move |_, _, state| {
                rotations.set(rotations.get() + 1);
                let degrees = 90 * (rotations.get() % 4);
                let ids: Vec<_> = state.tvsync.outputs.keys().copied().collect();
                for id in ids {
                    match state.tvsync.request_geometry_change(id, degrees, false) {
                        Ok(res) => debug!("output {}: rotate to {degrees}: {res:?}", id.get()),
                        Err(err) => warn!("error rotating output {}: {err}", id.get()),
                    }
                }
                TimeoutAction::ToDuration(every)
            })
            .map_err(|err| anyhow::anyhow!("error inserting rotation timer: {}", err.error))?;
    }

    event_loop
        .handle()
        .insert_source(
            Timer::from_duration(Duration::from_secs(cli.duration)),
            |_, _, state| {
                state.tvsync.stop_signal.stop();
                TimeoutAction::Drop
            },
        )
        .map_err(|err| anyhow::anyhow!("error inserting stop timer: {}", err.error))?;

    event_loop
        .run(None, &mut state, |state| {
            state.refresh();
            clients.dispatch_events(state);
        })
        .context("error running event loop")?;

    let report = report(&mut state);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for output in &report {
            print_report(output);
        }
    }

    Ok(())
}

fn report(state: &mut State) -> Vec<OutputReport> {
    let ids: Vec<_> = state.tvsync.outputs.keys().copied().collect();
    ids.into_iter()
        .filter_map(|id| {
            let renders = state.backend.headless().renders(id);
            let output = state.tvsync.outputs.get(&id)?;
            let geometry = output.display.geometry();
            let (pacing, pacer) = match &output.pacing {
                OutputPacing::Adaptive(pacer) => ("adaptive", Some(pacer)),
                OutputPacing::Fixed(_) => ("fixed", None),
            };
            Some(OutputReport {
                name: output.display.name().to_owned(),
                pacing,
                rotation: output.display.rotation().degrees(),
                width: geometry.size.w,
                height: geometry.size.h,
                update_interval_ms: pacer.map(|p| p.update_interval_ms()),
                frame_interval_ms: pacer.and_then(|p| p.frame_interval_ms()),
                renders,
                stats: pacer.map(|p| p.stats()),
            })
        })
        .collect()
}

fn print_report(output: &OutputReport) {
    println!(
        "{}: {} pacing, {}x{} rotation {}, {} frames rendered",
        output.name, output.pacing, output.width, output.height, output.rotation, output.renders
    );
    if let Some(interval) = output.update_interval_ms {
        println!("  update interval: {interval} ms");
    }
    if let Some(interval) = output.frame_interval_ms {
        println!("  frame callback interval: {interval} ms");
    }
    if let Some(stats) = &output.stats {
        println!(
            "  presented {}, missed {}, aborted {}, stale flips {}",
            stats.frames_presented, stats.frames_missed, stats.frames_aborted, stats.stale_flips
        );
        println!(
            "  frame time: last {} us, max {} us",
            stats.last_frame_time_us, stats.max_frame_time_us
        );
    }
}

fn env_config_path() -> Option<PathBuf> {
    env::var_os("TVSYNC_CONFIG")
        .filter(|x| !x.is_empty())
        .map(PathBuf::from)
}

fn default_config_path() -> Option<PathBuf> {
    let Some(dirs) = ProjectDirs::from("", "", "tvsync") else {
        warn!("error retrieving home directory");
        return None;
    };

    let mut path = dirs.config_dir().to_owned();
    path.push("config.kdl");
    Some(path)
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/tvsync/config.kdl")
}

/// Resolves the config to load and the path to watch for changes.
fn config_path(cli_path: Option<PathBuf>) -> (PathBuf, PathBuf) {
    if let Some(explicit) = cli_path.or_else(env_config_path) {
        return (explicit.clone(), explicit);
    }

    let system_path = system_config_path();
    if let Some(path) = default_config_path() {
        if path.exists() || !system_path.exists() {
            return (path.clone(), path);
        }

        (system_path, path)
    } else {
        (system_path.clone(), system_path)
    }
}
