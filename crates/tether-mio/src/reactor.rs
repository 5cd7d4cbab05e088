use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context as _, Error};
use mio::{event::Source, Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use thiserror::Error as ThisError;
use tracing::{event, instrument, Level};

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// How many threads dispatch reactor callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run the dispatch loop on the calling thread only.
    Single,
    /// Additionally spawn one dispatch thread per core.
    OnePerCore,
}

/// Readiness state delivered to a registered handler.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    /// The source has data (or a close) to read.
    pub readable: bool,
    /// The source will accept writes.
    pub writable: bool,
}

/// Registration handle for a source registered with the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken(pub(crate) Token);

type Task = Box<dyn FnOnce() + Send>;

/// Callback invoked with a source's readiness state.
pub type ReadyHandler = Arc<dyn Fn(Ready) + Send + Sync>;

/// Failed to run the reactor.
#[derive(ThisError, Debug)]
#[error("failed to run reactor")]
pub struct StartError {
    #[from]
    source: Error,
}

/// Failed to register a source with the reactor.
#[derive(ThisError, Debug)]
#[error("failed to register source")]
pub struct RegisterError {
    #[from]
    source: Error,
}

/// Run the process-wide reactor until stopped or out of work.
///
/// Convenience for `Reactor::global().start(mode)`.
pub fn start_service(mode: RunMode) -> Result<(), StartError> {
    Reactor::global().start(mode)
}

/// Process-wide asynchronous I/O dispatcher.
///
/// Owns the `mio` poll, a token-to-handler table and a queue of deferred
/// callbacks. [`Reactor::start`] runs the dispatch loop until [`Reactor::stop`]
/// is called or no work remains (no registered sources, no queued tasks and
/// no outstanding [`WorkGuard`]s). Workers race for the poll; whichever gets
/// it converts readiness into queued handler invocations the others drain.
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    poll: Mutex<Poll>,
    registry: mio::Registry,
    waker: Waker,
    next_token: AtomicUsize,
    handlers: Mutex<HashMap<Token, ReadyHandler>>,
    tasks: Mutex<VecDeque<Task>>,
    tasks_available: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    work: AtomicUsize,
}

impl Reactor {
    fn new() -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create poll")?;
        let registry = poll
            .registry()
            .try_clone()
            .context("failed to clone poll registry")?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).context("failed to create waker")?;

        let shared = Shared {
            poll: Mutex::new(poll),
            registry,
            waker,
            next_token: AtomicUsize::new(0),
            handlers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(VecDeque::new()),
            tasks_available: Condvar::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            work: AtomicUsize::new(0),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// The process-wide reactor instance.
    pub fn global() -> &'static Reactor {
        static REACTOR: OnceLock<Reactor> = OnceLock::new();
        REACTOR.get_or_init(|| Reactor::new().expect("failed to initialize reactor"))
    }

    /// Register a source; its handler runs whenever the source is ready.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: ReadyHandler,
    ) -> Result<IoToken, RegisterError>
    where
        S: Source,
    {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.handlers.lock().insert(token, handler);

        if let Err(error) = self.shared.registry.register(source, token, interest) {
            self.shared.handlers.lock().remove(&token);
            return Err(Error::from(error).into());
        }

        Ok(IoToken(token))
    }

    /// Change the interest set of a registered source.
    pub fn reregister<S>(
        &self,
        source: &mut S,
        token: IoToken,
        interest: Interest,
    ) -> Result<(), RegisterError>
    where
        S: Source,
    {
        self.shared
            .registry
            .reregister(source, token.0, interest)
            .map_err(|error| Error::from(error).into())
    }

    /// Remove a source and its handler.
    pub fn deregister<S>(&self, source: &mut S, token: IoToken) -> Result<(), RegisterError>
    where
        S: Source,
    {
        self.shared.handlers.lock().remove(&token.0);
        self.shared
            .registry
            .deregister(source)
            .map_err(|error| RegisterError::from(Error::from(error)))?;
        // The poll may be sleeping on a now-empty handler table.
        let _ = self.shared.waker.wake();
        Ok(())
    }

    /// Queue a callback to run on a reactor thread.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.lock().push_back(Box::new(task));
        self.shared.tasks_available.notify_one();
        let _ = self.shared.waker.wake();
    }

    /// Keep the reactor alive while idle.
    ///
    /// The reactor will not return from [`Reactor::start`] for lack of work
    /// while the returned guard lives.
    pub fn work(&self) -> WorkGuard {
        self.shared.work.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            shared: self.shared.clone(),
        }
    }

    /// Run the dispatch loop until stopped or out of work.
    ///
    /// With [`RunMode::OnePerCore`], one extra worker per remaining core is
    /// spawned and joined before this returns.
    #[instrument("Reactor::start", skip_all)]
    pub fn start(&self, mode: RunMode) -> Result<(), StartError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(anyhow!("reactor is already running").into());
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            // A stopped reactor stays stopped until reset.
            self.shared.running.store(false, Ordering::Release);
            return Ok(());
        }

        event!(Level::DEBUG, ?mode, "starting reactor");

        let workers = match mode {
            RunMode::Single => Vec::new(),
            RunMode::OnePerCore => (1..num_cpus::get())
                .map(|index| {
                    let shared = self.shared.clone();
                    thread::Builder::new()
                        .name(format!("tether-reactor-{index}"))
                        .spawn(move || run_worker(&shared))
                })
                .collect::<Result<Vec<_>, _>>()
                .context("failed to spawn reactor worker")?,
        };

        run_worker(&self.shared);

        for worker in workers {
            let _ = worker.join();
        }

        self.shared.running.store(false, Ordering::Release);
        event!(Level::DEBUG, "reactor finished");
        Ok(())
    }

    /// Stop the reactor; workers drain their current callback and exit.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.tasks_available.notify_all();
        let _ = self.shared.waker.wake();
    }

    /// Prepare a stopped reactor for a subsequent [`Reactor::start`].
    pub fn reset(&self) {
        self.shared.stopped.store(false, Ordering::Release);
    }
}

impl Shared {
    fn out_of_work(&self) -> bool {
        self.work.load(Ordering::Acquire) == 0
            && self.tasks.lock().is_empty()
            && self.handlers.lock().is_empty()
    }
}

fn run_worker(shared: &Shared) {
    let mut events = Events::with_capacity(256);

    loop {
        if shared.stopped.load(Ordering::Acquire) {
            shared.tasks_available.notify_all();
            return;
        }

        // Run one queued callback at a time so stop stays responsive.
        let task = shared.tasks.lock().pop_front();
        if let Some(task) = task {
            task();
            continue;
        }

        if let Some(mut poll) = shared.poll.try_lock() {
            if shared.out_of_work() {
                shared.stopped.store(true, Ordering::Release);
                drop(poll);
                shared.tasks_available.notify_all();
                return;
            }

            if let Err(error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                event!(Level::ERROR, ?error, "reactor poll failed");
                shared.stopped.store(true, Ordering::Release);
                shared.tasks_available.notify_all();
                return;
            }
            drop(poll);

            let mut dispatched = false;
            for ready_event in events.iter() {
                if ready_event.token() == WAKE_TOKEN {
                    continue;
                }
                let ready = Ready {
                    readable: ready_event.is_readable() || ready_event.is_read_closed(),
                    writable: ready_event.is_writable() || ready_event.is_write_closed(),
                };
                if !ready.readable && !ready.writable {
                    continue;
                }

                let handler = shared.handlers.lock().get(&ready_event.token()).cloned();
                if let Some(handler) = handler {
                    shared
                        .tasks
                        .lock()
                        .push_back(Box::new(move || handler(ready)));
                    dispatched = true;
                }
            }
            if dispatched {
                shared.tasks_available.notify_all();
            }
        } else {
            // Another worker owns the poll; wait for it to queue work.
            let mut tasks = shared.tasks.lock();
            if tasks.is_empty() && !shared.stopped.load(Ordering::Acquire) {
                shared.tasks_available.wait_for(&mut tasks, WAIT_TIMEOUT);
            }
        }
    }
}

/// RAII guard returned by [`Reactor::work`].
pub struct WorkGuard {
    shared: Arc<Shared>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.shared.work.fetch_sub(1, Ordering::AcqRel);
        let _ = self.shared.waker.wake();
    }
}
