//! Threads driving a [`LoadBalancer`].
//!
//! Events are sharded over a fixed set of workers by flow key, so every event
//! and acknowledgment concerning one flow is handled by the same worker in
//! arrival order. A router thread moves acknowledgments from the adapter's
//! channel to the owning worker, and a sweeper thread asks every worker to
//! expire its own idle flows.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::flow_key::FlowKey;
use crate::load_balancer::LoadBalancer;
use crate::switch::{AckReceiver, CommandAck, EventSink, SwitchEvent};

/// How often the ack router checks for shutdown while idle.
const ROUTER_POLL: Duration = Duration::from_millis(100);

enum Job {
    Event(SwitchEvent),
    Ack(CommandAck),
    Sweep(Instant),
    Stop,
}

/// Hands events to the worker owning their flow.
#[derive(Clone)]
pub struct Dispatcher {
    workers: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    fn shard(&self, key: Option<FlowKey>) -> usize {
        key.map_or(0, |k| k.shard(self.workers.len()))
    }

    fn send(&self, shard: usize, job: Job) {
        if self.workers[shard].send(job).is_err() {
            debug!(shard, "worker gone, dropping job");
        }
    }

    fn sweep(&self, now: Instant) {
        for shard in 0..self.workers.len() {
            self.send(shard, Job::Sweep(now));
        }
    }
}

impl EventSink for Dispatcher {
    fn dispatch(&self, event: SwitchEvent) {
        let shard = self.shard(event.flow_key());
        self.send(shard, Job::Event(event));
    }
}

pub struct EventLoop {
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    stop_sweeper: Option<mpsc::Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    helpers: Vec<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the worker, router and sweeper threads for `lb`, routing the
    /// acknowledgments arriving on `acks`.
    pub fn start(lb: Arc<LoadBalancer>, acks: AckReceiver) -> io::Result<EventLoop> {
        let n = lb.config().workers.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let (tx, rx) = mpsc::channel::<Job>();
            let lb = lb.clone();
            let handle = thread::Builder::new()
                .name(format!("lb-worker-{}", i))
                .spawn(move || run_worker(&lb, rx, i, n))?;
            senders.push(tx);
            workers.push(handle);
        }
        let dispatcher = Dispatcher { workers: senders };
        let shutdown = Arc::new(AtomicBool::new(false));

        let router = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("lb-ack-router".to_string())
                .spawn(move || route_acks(&dispatcher, &acks, &shutdown))?
        };

        let (stop_sweeper, stop_rx) = mpsc::channel::<()>();
        let sweeper = {
            let dispatcher = dispatcher.clone();
            let interval = lb.config().sweep_interval;
            thread::Builder::new()
                .name("lb-sweeper".to_string())
                .spawn(move || run_sweeper(&dispatcher, &stop_rx, interval))?
        };

        info!(workers = n, policy = %lb.policy_kind(), "event loop started");
        Ok(EventLoop {
            dispatcher,
            shutdown,
            stop_sweeper: Some(stop_sweeper),
            workers,
            helpers: vec![router, sweeper],
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Stop every thread. Events dispatched before the call are still handled.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_sweeper.take();
        for h in self.helpers.drain(..) {
            join(h);
        }
        for shard in 0..self.dispatcher.workers.len() {
            self.dispatcher.send(shard, Job::Stop);
        }
        for h in self.workers.drain(..) {
            join(h);
        }
        info!("event loop stopped");
    }
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if handle.join().is_err() {
        warn!(thread = %name, "thread panicked");
    }
}

fn run_worker(lb: &LoadBalancer, jobs: mpsc::Receiver<Job>, shard: usize, shards: usize) {
    while let Ok(job) = jobs.recv() {
        match job {
            // Failures are logged and counted by the controller itself.
            Job::Event(event) => {
                let _ = lb.handle_event(event, Instant::now());
            }
            Job::Ack(ack) => lb.handle_ack(ack, Instant::now()),
            Job::Sweep(now) => {
                lb.sweep_shard(now, shard, shards);
            }
            Job::Stop => break,
        }
    }
}

fn route_acks(dispatcher: &Dispatcher, acks: &AckReceiver, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match acks.recv_timeout(ROUTER_POLL) {
            Ok(ack) => {
                let shard = dispatcher.shard(ack.submission.command.flow_key());
                dispatcher.send(shard, Job::Ack(ack));
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_sweeper(dispatcher: &Dispatcher, stop: &mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => dispatcher.sweep(Instant::now()),
            _ => break,
        }
    }
}
