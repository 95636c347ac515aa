//! Config file watcher.
//!
//! Polls the canonical path and modification time from a background thread. Polling keeps
//! symlinked configs (including ones where only the link target is swapped and the mtime stays
//! put) working without any platform-specific notification API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use calloop::channel::SyncSender;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Watcher {
    should_stop: Arc<AtomicBool>,
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }
}

fn props(path: &Path) -> Option<(SystemTime, PathBuf)> {
    let canon = path.canonicalize().ok()?;
    let modified = canon.metadata().and_then(|meta| meta.modified()).ok()?;
    Some((modified, canon))
}

impl Watcher {
    pub fn new<T: Send + 'static>(
        path: PathBuf,
        process: impl FnMut(&Path) -> T + Send + 'static,
        changed: SyncSender<T>,
    ) -> anyhow::Result<Self> {
        Self::with_start_notification(path, process, changed, None)
    }

    pub fn with_start_notification<T: Send + 'static>(
        path: PathBuf,
        mut process: impl FnMut(&Path) -> T + Send + 'static,
        changed: SyncSender<T>,
        started: Option<mpsc::SyncSender<()>>,
    ) -> anyhow::Result<Self> {
        let should_stop = Arc::new(AtomicBool::new(false));

        {
            let should_stop = should_stop.clone();
            thread::Builder::new()
                .name(format!("Filesystem Watcher for {}", path.to_string_lossy()))
                .spawn(move || {
                    let mut last_props = props(&path);

                    if let Some(started) = started {
                        let _ = started.send(());
                    }

                    loop {
                        thread::sleep(POLL_INTERVAL);

                        if should_stop.load(Ordering::SeqCst) {
                            break;
                        }

                        let Some(new_props) = props(&path) else {
                            continue;
                        };

                        if last_props.as_ref() == Some(&new_props) {
                            continue;
                        }

                        trace!("file changed: {}", path.to_string_lossy());

                        let rv = process(&path);
                        if let Err(err) = changed.send(rv) {
                            warn!("error sending change notification: {err:?}");
                            break;
                        }

                        last_props = Some(new_props);
                    }

                    debug!("exiting watcher thread for {}", path.to_string_lossy());
                })
                .context("error spawning the watcher thread")?;
        }

        Ok(Self { should_stop })
    }
}
