// src/supervisor.rs
//
// Master mode. One worker OS process per channel config; the supervisor
// only launches, watches and restarts them. Worker crashes stay isolated
// to their own channel and the supervisor restarts without limit.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Timing knobs, injectable so tests run in milliseconds.
pub struct SupervisorOptions {
    /// Pause between initial worker launches so capture sources do not all
    /// connect at once.
    pub stagger: Duration,
    /// How often worker liveness is checked.
    pub poll_interval: Duration,
    /// Pause between a worker's exit and its relaunch.
    pub backoff: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stagger: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            backoff: Duration::from_secs(3),
        }
    }
}

type SpawnFn = Box<dyn FnMut(&Path) -> std::io::Result<Child> + Send>;

struct WorkerSlot {
    config: PathBuf,
    child: Option<Child>,
    restarts: u64,
    down_since: Option<Instant>,
}

pub struct Supervisor {
    slots: Vec<WorkerSlot>,
    options: SupervisorOptions,
    spawn: SpawnFn,
}

impl Supervisor {
    /// Production supervisor: every `*.json` under `dir` becomes a worker
    /// running `current_exe --mode slave --config <file>`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let configs = discover_configs(dir.as_ref())?;
        let exe = std::env::current_exe().context("cannot resolve own executable path")?;
        let spawn: SpawnFn = Box::new(move |config: &Path| {
            Command::new(&exe)
                .arg("--mode")
                .arg("slave")
                .arg("--config")
                .arg(config)
                .spawn()
        });
        Ok(Self::with_spawn(configs, SupervisorOptions::default(), spawn))
    }

    pub fn with_spawn(configs: Vec<PathBuf>, options: SupervisorOptions, spawn: SpawnFn) -> Self {
        let slots = configs
            .into_iter()
            .map(|config| WorkerSlot {
                config,
                child: None,
                restarts: 0,
                down_since: None,
            })
            .collect();
        Self {
            slots,
            options,
            spawn,
        }
    }

    /// Launch all workers and watch them until `stop` is raised, then
    /// terminate every worker and wait on each before returning.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!("🚀 supervising {} workers", self.slots.len());

        for i in 0..self.slots.len() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if i > 0 {
                sleep_unless(self.options.stagger, stop);
            }
            launch(&mut self.slots[i], &mut self.spawn, false);
        }

        while !stop.load(Ordering::Relaxed) {
            sleep_unless(self.options.poll_interval, stop);

            for slot in &mut self.slots {
                match &mut slot.child {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            warn!(
                                "worker for {:?} exited ({}), restarting in {:?}",
                                slot.config, status, self.options.backoff
                            );
                            slot.child = None;
                            slot.down_since = Some(Instant::now());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("cannot poll worker for {:?}: {}", slot.config, e);
                        }
                    },
                    None => {
                        let due = slot
                            .down_since
                            .map(|t| t.elapsed() >= self.options.backoff)
                            .unwrap_or(true);
                        if due {
                            launch(slot, &mut self.spawn, true);
                        }
                    }
                }
            }
        }

        self.shutdown();
    }

    /// How many times the worker for `config` has been relaunched.
    pub fn restarts(&self, config: &Path) -> u64 {
        self.slots
            .iter()
            .find(|s| s.config == config)
            .map(|s| s.restarts)
            .unwrap_or(0)
    }

    fn shutdown(&mut self) {
        info!("stopping {} workers", self.slots.len());
        for slot in &mut self.slots {
            if let Some(mut child) = slot.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn launch(slot: &mut WorkerSlot, spawn: &mut SpawnFn, is_restart: bool) {
    match spawn(&slot.config) {
        Ok(child) => {
            if is_restart {
                slot.restarts += 1;
            }
            info!("started worker for {:?} (pid {})", slot.config, child.id());
            slot.child = Some(child);
            slot.down_since = None;
        }
        Err(e) => {
            error!("failed to start worker for {:?}: {}", slot.config, e);
            slot.down_since = Some(Instant::now());
        }
    }
}

/// Sleep in short slices so a stop request is observed promptly.
fn sleep_unless(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(10).min(total);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(slice);
    }
}

/// All `*.json` files under `dir`, recursively, in stable order.
pub fn discover_configs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut configs = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().map(|e| e == "json").unwrap_or(false)
        {
            configs.push(entry.path().to_path_buf());
        }
    }
    configs.sort();
    if configs.is_empty() {
        bail!("no worker configs (*.json) found under {:?}", dir);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, Mutex};

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions {
            stagger: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            backoff: Duration::from_millis(10),
        }
    }

    fn counting_spawn(command: &'static str, counter: Arc<AtomicU64>) -> SpawnFn {
        Box::new(move |_config: &Path| {
            counter.fetch_add(1, Ordering::Relaxed);
            Command::new("sh").arg("-c").arg(command).spawn()
        })
    }

    #[test]
    fn test_discover_configs_finds_nested_json_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("sub/a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let configs = discover_configs(dir.path()).unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs[0].ends_with("b.json"));
        assert!(configs[1].ends_with("sub/a.json"));
    }

    #[test]
    fn test_discover_configs_rejects_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_configs(dir.path()).is_err());
    }

    #[test]
    fn test_healthy_worker_is_not_restarted() {
        let starts = Arc::new(AtomicU64::new(0));
        let config = PathBuf::from("ch1.json");
        let mut sup = Supervisor::with_spawn(
            vec![config.clone()],
            fast_options(),
            counting_spawn("sleep 30", starts.clone()),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        });

        sup.run(&stop);
        handle.join().unwrap();

        assert_eq!(starts.load(Ordering::Relaxed), 1);
        assert_eq!(sup.restarts(&config), 0);
    }

    #[test]
    fn test_stop_flag_terminates_live_workers() {
        let pid = Arc::new(Mutex::new(None::<u32>));
        let seen = pid.clone();
        let spawn: SpawnFn = Box::new(move |_config: &Path| {
            let child = Command::new("sh").arg("-c").arg("sleep 30").spawn()?;
            *seen.lock().unwrap() = Some(child.id());
            Ok(child)
        });
        let mut sup =
            Supervisor::with_spawn(vec![PathBuf::from("ch1.json")], fast_options(), spawn);

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Relaxed);
        });

        sup.run(&stop);
        handle.join().unwrap();

        // The worker was killed and reaped before run() returned.
        let pid = pid.lock().unwrap().expect("worker was spawned");
        let gone = !Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .unwrap()
            .success();
        assert!(gone, "worker {pid} must not outlive the supervisor");
    }

    #[test]
    fn test_exiting_worker_started_once_more_than_restarted() {
        let starts = Arc::new(AtomicU64::new(0));
        let config = PathBuf::from("ch1.json");
        let mut sup = Supervisor::with_spawn(
            vec![config.clone()],
            fast_options(),
            counting_spawn("true", starts.clone()),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::Relaxed);
        });

        sup.run(&stop);
        handle.join().unwrap();

        let started = starts.load(Ordering::Relaxed);
        assert!(started >= 2, "dead worker must be relaunched (started {started} times)");
        assert_eq!(
            started,
            sup.restarts(&config) + 1,
            "every start after the first is a restart"
        );
    }
}
