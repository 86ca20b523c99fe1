//! Plugin hosting.
//!
//! A plugin is a named unit of script code behind the [`Plugin`] trait; the
//! interpreter that backs it is not our business. What matters here is the
//! execution model: every plugin gets a private FIFO queue drained by its
//! own worker thread, so neither the engine nor the audio paths ever run
//! plugin code, and a stuck plugin stalls only itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} failed to load: {1}")]
    Load(String, String),
    #[error("no such plugin: {0}")]
    Unknown(String),
}

/// Events delivered to plugin code, one at a time, in queue order.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    UserJoinedServer { session: u32, name: String },
    TextMessage { session: u32, name: String, message: String },
    CommandMessage { session: u32, name: String, command: String },
    Playback { name: String },
    UserStats { session: u32 },
    Tick,
}

pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn handle_event(&mut self, event: PluginEvent);
}

/// Produces plugin instances by name; implemented by whatever script
/// engine the binary embeds.
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Loader for a build without a script engine: every load fails.
pub struct NullLoader;

impl PluginLoader for NullLoader {
    fn load(&self, name: &str) -> Result<Box<dyn Plugin>, PluginError> {
        Err(PluginError::Unknown(name.to_string()))
    }
}

struct Worker {
    queue: Sender<PluginEvent>,
    exiting: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// The set of loaded plugins and their workers.
pub struct PluginHost {
    loader: Box<dyn PluginLoader>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl PluginHost {
    pub fn new(loader: Box<dyn PluginLoader>) -> Self {
        PluginHost {
            loader,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.workers.lock().unwrap().contains_key(name)
    }

    /// Registers a plugin and starts its worker thread. An already-loaded
    /// plugin of the same name is shut down first.
    pub fn register(&self, plugin: Box<dyn Plugin>) {
        let name = plugin.name().to_string();

        if let Some(old) = self.workers.lock().unwrap().remove(&name) {
            shutdown_worker(&name, old);
        }

        info!("loading plugin {}...", name);

        let (queue, rx) = mpsc::channel::<PluginEvent>();
        let exiting = Arc::new(AtomicBool::new(false));

        let thread_exiting = exiting.clone();
        let mut plugin = plugin;
        let thread = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                // work queued before shutdown but not yet run is discarded
                if thread_exiting.load(Ordering::SeqCst) {
                    break;
                }
                plugin.handle_event(event);
            }
        });

        self.workers.lock().unwrap().insert(
            name,
            Worker {
                queue,
                exiting,
                thread,
            },
        );
    }

    /// Loads (or reloads) a plugin through the script engine.
    pub fn reload(&self, name: &str) -> Result<(), PluginError> {
        let plugin = self.loader.load(name)?;
        self.register(plugin);
        Ok(())
    }

    /// Queues an event for one plugin. Returns false if the plugin is
    /// unknown or already shutting down.
    pub fn queue(&self, name: &str, event: PluginEvent) -> bool {
        let workers = self.workers.lock().unwrap();

        match workers.get(name) {
            Some(worker) if !worker.exiting.load(Ordering::SeqCst) => {
                worker.queue.send(event).is_ok()
            }
            _ => false,
        }
    }

    /// Queues an event for every plugin. Each worker gets its own copy;
    /// the consumers run in parallel and must not share the payload.
    pub fn queue_all(&self, event: PluginEvent) {
        let workers = self.workers.lock().unwrap();

        for worker in workers.values() {
            if !worker.exiting.load(Ordering::SeqCst) {
                let _ = worker.queue.send(event.clone());
            }
        }
    }

    /// Unloads one plugin, joining its worker.
    pub fn unload(&self, name: &str) -> bool {
        let worker = self.workers.lock().unwrap().remove(name);
        match worker {
            Some(worker) => {
                shutdown_worker(name, worker);
                true
            }
            None => false,
        }
    }

    /// Unloads everything; called on teardown.
    pub fn shutdown(&self) {
        let workers: Vec<_> = {
            let mut map = self.workers.lock().unwrap();
            map.drain().collect()
        };

        let count = workers.len();
        for (name, worker) in workers {
            shutdown_worker(&name, worker);
        }

        if count > 0 {
            info!("{} plugin(s) unloaded", count);
        }
    }
}

fn shutdown_worker(name: &str, worker: Worker) {
    info!("unloading plugin {}...", name);

    worker.exiting.store(true, Ordering::SeqCst);
    // closing the channel wakes the worker if it is idle
    drop(worker.queue);

    if worker.thread.join().is_err() {
        warn!("worker thread of plugin {} panicked", name);
    }
}

/// Fans a Tick to all plugins at `freq` per second until aborted.
pub fn spawn_ticker(host: Arc<PluginHost>, freq: u32) -> tokio::task::JoinHandle<()> {
    let period = std::time::Duration::from_millis(1000 / freq.max(1) as u64);

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        loop {
            timer.tick().await;
            host.queue_all(PluginEvent::Tick);
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::mpsc::Sender;

    use super::*;

    /// Forwards every event to a channel, tagged with the plugin name.
    pub struct RecordingPlugin {
        pub name: String,
        pub seen: Sender<(String, PluginEvent)>,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle_event(&mut self, event: PluginEvent) {
            let _ = self.seen.send((self.name.clone(), event));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::RecordingPlugin;
    use super::*;

    fn host_with(names: &[&str]) -> (PluginHost, std::sync::mpsc::Receiver<(String, PluginEvent)>) {
        let (tx, rx) = mpsc::channel();
        let host = PluginHost::new(Box::new(NullLoader));
        for &name in names {
            host.register(Box::new(RecordingPlugin {
                name: name.to_string(),
                seen: tx.clone(),
            }));
        }
        (host, rx)
    }

    #[test]
    fn events_arrive_in_fifo_order() {
        let (host, rx) = host_with(&["p"]);

        for i in 0..10 {
            host.queue(
                "p",
                PluginEvent::Playback {
                    name: format!("{}", i),
                },
            );
        }

        for i in 0..10 {
            let (_, event) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(
                event,
                PluginEvent::Playback {
                    name: format!("{}", i)
                }
            );
        }

        host.shutdown();
    }

    #[test]
    fn queue_all_reaches_every_plugin() {
        let (host, rx) = host_with(&["a", "b", "c"]);

        host.queue_all(PluginEvent::Tick);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (name, event) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(event, PluginEvent::Tick);
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);

        host.shutdown();
    }

    #[test]
    fn unknown_plugin_is_not_queued() {
        let (host, _rx) = host_with(&["a"]);
        assert!(!host.queue("nope", PluginEvent::Tick));
        host.shutdown();
    }

    #[test]
    fn unload_stops_delivery() {
        let (host, rx) = host_with(&["a"]);

        assert!(host.unload("a"));
        assert!(!host.has_plugin("a"));
        assert!(!host.queue("a", PluginEvent::Tick));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn register_replaces_existing_worker() {
        let (host, rx) = host_with(&["a"]);
        let (tx2, rx2) = mpsc::channel();

        host.register(Box::new(RecordingPlugin {
            name: "a".to_string(),
            seen: tx2,
        }));

        host.queue("a", PluginEvent::Tick);
        assert!(rx2.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        host.shutdown();
    }

    #[test]
    fn reload_via_loader_fails_without_engine() {
        let host = PluginHost::new(Box::new(NullLoader));
        assert!(host.reload("x").is_err());
    }
}
