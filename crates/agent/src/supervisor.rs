use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::WorkerSpec;

type HaltHandler = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation for a long-running worker. Stopping only raises a
/// flag; the worker has to poll `check` (or `wait`) and return on its own.
pub struct HaltCheck {
    flag: Arc<AtomicBool>,
    handler: Mutex<Option<HaltHandler>>,
    halted: AtomicBool,
}

impl HaltCheck {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            handler: Mutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    /// Register what should happen when a halt is observed. Without a handler a
    /// raised flag exits the process.
    pub fn set_halt_handler(&self, handler: impl FnOnce() + Send + 'static) {
        let mut slot = match self.handler.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(handler));
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `true` once a halt has been requested. The handler runs on the first such call only.
    pub fn check(&self) -> bool {
        if !self.is_requested() {
            return false;
        }
        if self.halted.swap(true, Ordering::SeqCst) {
            return true;
        }
        let handler = match self.handler.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handler {
            Some(handler) => handler(),
            None => {
                info!("halt requested with no handler registered; exiting");
                std::process::exit(0);
            }
        }
        true
    }

    /// Sleep up to `secs` seconds, checking for a halt once per second.
    pub async fn wait(&self, secs: u64) -> bool {
        for _ in 0..secs {
            if self.check() {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.check()
    }
}

/// A worker's entry points, selected by method name at start-up.
#[async_trait]
pub trait Worker: Send {
    async fn invoke(&mut self, method: &str, halt: Arc<HaltCheck>) -> anyhow::Result<()>;
}

pub type WorkerFactory =
    Box<dyn Fn(&ProcessDescriptor) -> anyhow::Result<Box<dyn Worker>> + Send + Sync>;

/// Maps target names from configuration to worker constructors.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, target: impl Into<String>, factory: F)
    where
        F: Fn(&ProcessDescriptor) -> anyhow::Result<Box<dyn Worker>> + Send + Sync + 'static,
    {
        self.factories.insert(target.into(), Box::new(factory));
    }

    pub fn create(&self, desc: &ProcessDescriptor) -> anyhow::Result<Box<dyn Worker>> {
        let factory = self
            .factories
            .get(&desc.target)
            .ok_or_else(|| anyhow::anyhow!("no worker registered for target {:?}", desc.target))?;
        factory(desc)
    }

    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub name: String,
    pub target: String,
    pub method: String,
    pub halt: Arc<AtomicBool>,
    pub pid: u32,
}

impl ProcessDescriptor {
    pub fn new(spec: &WorkerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            target: spec.target.clone(),
            method: spec.method.clone(),
            halt: Arc::new(AtomicBool::new(false)),
            pid: std::process::id(),
        }
    }

    pub fn request_stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn halt_check(&self) -> HaltCheck {
        HaltCheck::new(self.halt.clone())
    }
}

struct SupervisedProcess {
    descriptor: ProcessDescriptor,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Runs named workers on their own tasks and stops them through their halt flags.
pub struct Supervisor {
    registry: Arc<WorkerRegistry>,
    processes: tokio::sync::Mutex<Vec<SupervisedProcess>>,
}

impl Supervisor {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            processes: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self, spec: &WorkerSpec) -> anyhow::Result<ProcessDescriptor> {
        let descriptor = ProcessDescriptor::new(spec);
        let mut worker = self.registry.create(&descriptor)?;
        let halt = Arc::new(descriptor.halt_check());
        let method = descriptor.method.clone();
        let name = descriptor.name.clone();

        let handle = tokio::spawn(async move {
            let res = worker.invoke(&method, halt).await;
            match &res {
                Ok(()) => info!(worker = %name, "worker exited"),
                Err(e) => warn!(worker = %name, error = %e, "worker failed"),
            }
            res
        });
        info!(worker = %descriptor.name, target = %descriptor.target, method = %descriptor.method, pid = descriptor.pid, "worker started");

        self.processes.lock().await.push(SupervisedProcess {
            descriptor: descriptor.clone(),
            handle,
        });
        Ok(descriptor)
    }

    /// Raise the halt flag of one worker. Returns `false` if no such worker runs.
    pub async fn stop(&self, name: &str) -> bool {
        let processes = self.processes.lock().await;
        let mut found = false;
        for p in processes.iter().filter(|p| p.descriptor.name == name) {
            p.descriptor.request_stop();
            found = true;
        }
        found
    }

    /// Wait for every started worker to return, yielding each one's outcome.
    pub async fn wait_all(&self) -> Vec<(String, anyhow::Result<()>)> {
        let processes: Vec<SupervisedProcess> = self.processes.lock().await.drain(..).collect();
        let mut outcomes = Vec::with_capacity(processes.len());
        for p in processes {
            let res = match p.handle.await {
                Ok(res) => res,
                Err(e) => Err(anyhow::anyhow!("worker task panicked: {e}")),
            };
            outcomes.push((p.descriptor.name, res));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn halt_with_counter() -> (Arc<AtomicBool>, HaltCheck, Arc<AtomicUsize>) {
        let flag = Arc::new(AtomicBool::new(false));
        let check = HaltCheck::new(flag.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        check.set_halt_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (flag, check, calls)
    }

    #[test]
    fn handler_never_runs_while_flag_is_clear() {
        let (_flag, check, calls) = halt_with_counter();
        for _ in 0..100 {
            assert!(!check.check());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_runs_exactly_once_after_flag_is_set() {
        let (flag, check, calls) = halt_with_counter();
        assert!(!check.check());
        flag.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            assert!(check.check());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_early_when_halted() {
        let (flag, check, calls) = halt_with_counter();
        let check = Arc::new(check);
        let waiter = {
            let check = check.clone();
            tokio::spawn(async move { check.wait(60).await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        flag.store(true, Ordering::SeqCst);
        let started = tokio::time::Instant::now();
        assert!(waiter.await.unwrap());
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_halt() {
        let (_flag, check, calls) = halt_with_counter();
        let started = tokio::time::Instant::now();
        assert!(!check.wait(3).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct CountingWorker {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        async fn invoke(&mut self, method: &str, halt: Arc<HaltCheck>) -> anyhow::Result<()> {
            anyhow::ensure!(method == "launch", "unknown method {method}");
            halt.set_halt_handler(|| {});
            while !halt.check() {
                self.ticks.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        }
    }

    fn counting_registry(ticks: Arc<AtomicUsize>) -> Arc<WorkerRegistry> {
        let mut registry = WorkerRegistry::new();
        registry.register("counter", move |_desc| {
            Ok(Box::new(CountingWorker {
                ticks: ticks.clone(),
            }) as Box<dyn Worker>)
        });
        Arc::new(registry)
    }

    fn spec(name: &str, target: &str, method: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.into(),
            target: target.into(),
            method: method.into(),
        }
    }

    #[tokio::test]
    async fn stop_is_cooperative_and_worker_exits_cleanly() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(counting_registry(ticks.clone()));
        let desc = supervisor.start(&spec("w1", "counter", "launch")).await.unwrap();
        assert_eq!(desc.pid, std::process::id());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.stop("w1").await);
        assert!(!supervisor.stop("missing").await);

        let outcomes = supervisor.wait_all().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "w1");
        assert!(outcomes[0].1.is_ok());
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn unknown_method_surfaces_as_worker_error() {
        let supervisor = Supervisor::new(counting_registry(Arc::new(AtomicUsize::new(0))));
        supervisor.start(&spec("w1", "counter", "start")).await.unwrap();
        let outcomes = supervisor.wait_all().await;
        assert!(outcomes[0].1.is_err());
    }

    #[tokio::test]
    async fn unknown_target_is_rejected_at_start() {
        let supervisor = Supervisor::new(counting_registry(Arc::new(AtomicUsize::new(0))));
        let err = supervisor
            .start(&spec("w1", "nope", "start"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
