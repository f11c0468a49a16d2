//! Master role over TCP.
//!
//! Threads: one accept loop, one session per worker (plus a reader feeding
//! it), and one event consumer that runs progress callbacks. The task queue
//! and per-worker bookkeeping live in a single mutex-guarded [`Dispatch`].

use super::config::MasterConfig;
use super::partition::{Task, chunks, partition};
use super::protocol::{self, Message, codes};
use super::{LocalHandler, MasterContext, MasterState, TaskCallback, WorkerInfo};
use crate::error::{Error, Result};
use crate::observability;
use crate::registry::ComponentRegistry;
use crate::serial;
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
struct QueuedTask {
    id: u64,
    task: Task,
    /// Already reported to progress observers by an earlier run.
    counted: bool,
}

struct WorkerSlot {
    info: WorkerInfo,
    current: Option<QueuedTask>,
    /// Ranges finished this pass; their results live on the worker.
    done: Vec<QueuedTask>,
    commands: Sender<SessionInput>,
}

struct Dispatch {
    state: MasterState,
    queue: VecDeque<QueuedTask>,
    workers: BTreeMap<u64, WorkerSlot>,
    /// Queued plus in-flight tasks.
    outstanding: usize,
    sync_state: Option<Arc<Vec<u8>>>,
    /// Workers that left after finishing tasks of a completed pass.
    lost_results: Vec<String>,
}

impl Dispatch {
    fn wake_all(&self) {
        for slot in self.workers.values() {
            let _ = slot.commands.send(SessionInput::Wake);
        }
    }
}

enum Event {
    Progress(u64),
    Flush(Sender<()>),
    Stop,
}

enum SessionInput {
    Net(Result<Option<Message>>),
    Wake,
    Send(Message),
    Complete(Sender<Result<()>>),
    Gather {
        locator: String,
        reply: Sender<Result<Vec<u8>>>,
    },
    Close,
}

struct Shared {
    config: MasterConfig,
    dispatch: Mutex<Dispatch>,
    changed: Condvar,
    allow: AtomicBool,
    shutdown: AtomicBool,
    next_worker_id: AtomicU64,
    next_task_id: AtomicU64,
    events: Sender<Event>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a worker and put its unfinished work back in the queue.
    ///
    /// While a pass is running, ranges the worker already finished are queued
    /// again too, since their partial results are lost with the worker.
    fn remove_worker(&self, id: u64, reason: &Error) {
        let mut d = self.lock();
        let Some(slot) = d.workers.remove(&id) else {
            return;
        };

        let mut requeued = 0;
        if let Some(task) = slot.current {
            d.queue.push_front(task);
            requeued += 1;
        }
        if d.state == MasterState::Busy {
            for task in slot.done {
                d.queue.push_back(task);
                d.outstanding += 1;
                requeued += 1;
            }
        } else if !slot.done.is_empty() {
            d.lost_results.push(slot.info.name.clone());
        }

        observability::record_workers_connected(d.workers.len());
        if requeued > 0 {
            observability::record_tasks_reassigned(requeued);
            tracing::warn!(
                worker = id,
                name = %slot.info.name,
                requeued,
                error = %reason,
                "worker lost, reassigning its tasks"
            );
        } else {
            tracing::info!(worker = id, name = %slot.info.name, reason = %reason, "worker disconnected");
        }
        d.wake_all();
        drop(d);
        self.changed.notify_all();
    }
}

/// Master listening on a TCP socket.
pub struct TcpMaster {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    callbacks: Arc<Mutex<Vec<TaskCallback>>>,
    local_handler: Option<LocalHandler>,
    accept_thread: Option<JoinHandle<()>>,
    event_thread: Option<JoinHandle<()>>,
}

impl TcpMaster {
    /// Bind the listen socket and start the accept loop.
    pub fn bind(config: MasterConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events_rx) = kanal::unbounded();
        let allow = config.allow_connections;
        let shared = Arc::new(Shared {
            config,
            dispatch: Mutex::new(Dispatch {
                state: if allow {
                    MasterState::AcceptingConnections
                } else {
                    MasterState::Initialized
                },
                queue: VecDeque::new(),
                workers: BTreeMap::new(),
                outstanding: 0,
                sync_state: None,
                lost_results: Vec::new(),
            }),
            changed: Condvar::new(),
            allow: AtomicBool::new(allow),
            shutdown: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
            next_task_id: AtomicU64::new(1),
            events: events_tx,
        });

        let callbacks: Arc<Mutex<Vec<TaskCallback>>> = Arc::default();
        let event_thread = {
            let callbacks = Arc::clone(&callbacks);
            thread::Builder::new()
                .name("lumen-master-events".into())
                .spawn(move || run_events(events_rx, callbacks))?
        };
        let accept_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("lumen-master-accept".into())
                .spawn(move || accept_loop(shared, listener))?
        };

        tracing::info!(addr = %local_addr, "master listening");
        Ok(Self {
            shared,
            local_addr,
            callbacks,
            local_handler: None,
            accept_thread: Some(accept_thread),
            event_thread: Some(event_thread),
        })
    }

    fn report_progress(&self, processed: u64) {
        observability::record_tasks_completed(processed);
        let _ = self.shared.events.send(Event::Progress(processed));
    }

    /// Wait until the event consumer has run every callback queued so far.
    fn flush_events(&self) {
        let (tx, rx) = kanal::bounded(1);
        if self.shared.events.send(Event::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    fn wait_outstanding(&mut self) -> Result<()> {
        let timeout = self.shared.config.completion_timeout;
        let poll = self.shared.config.poll_interval;
        let mut last_progress = Instant::now();
        let mut d = self.shared.lock();
        let mut last_outstanding = d.outstanding;

        while d.outstanding > 0 {
            if d.workers.is_empty() && self.local_handler.is_some() {
                if let Some(queued) = d.queue.pop_front() {
                    drop(d);
                    tracing::debug!(task = %queued.task, "processing task locally");
                    if let Some(handler) = self.local_handler.as_mut() {
                        handler(queued.task.start, queued.task.end)?;
                    }
                    if !queued.counted {
                        self.report_progress(queued.task.len());
                    }
                    d = self.shared.lock();
                    d.outstanding -= 1;
                    last_progress = Instant::now();
                    last_outstanding = d.outstanding;
                    continue;
                }
            }

            d = self
                .shared
                .changed
                .wait_timeout(d, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if d.outstanding != last_outstanding {
                last_outstanding = d.outstanding;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > timeout {
                return Err(Error::TaskTimeout(format!(
                    "{} task(s) outstanding with {} worker(s) connected",
                    d.outstanding,
                    d.workers.len()
                )));
            }
        }
        Ok(())
    }
}

fn recv_reply<T>(rx: &Receiver<Result<T>>, timeout: Duration, what: &str) -> Result<T> {
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(ReceiveErrorTimeout::Timeout) => Err(Error::TaskTimeout(format!(
            "no {what} reply within {timeout:?}"
        ))),
        Err(_) => Err(Error::ConnectionLost(format!(
            "worker left before sending its {what} reply"
        ))),
    }
}

impl MasterContext for TcpMaster {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn state(&self) -> MasterState {
        self.shared.lock().state
    }

    fn allow_connection(&mut self, allow: bool) {
        self.shared.allow.store(allow, Ordering::SeqCst);
        let mut d = self.shared.lock();
        d.state = match (d.state, allow) {
            (MasterState::Initialized, true) => MasterState::AcceptingConnections,
            (MasterState::AcceptingConnections, false) => MasterState::Initialized,
            (state, _) => state,
        };
        tracing::info!(allow, "worker connections");
    }

    fn sync(&mut self, registry: &ComponentRegistry) -> Result<()> {
        let state = Arc::new(serial::to_bytes(registry.root())?.to_vec());
        let mut d = self.shared.lock();
        for slot in d.workers.values() {
            let _ = slot.commands.send(SessionInput::Send(Message::Sync {
                state: state.as_ref().clone(),
            }));
        }
        tracing::debug!(bytes = state.len(), workers = d.workers.len(), "synced state");
        d.sync_state = Some(state);
        Ok(())
    }

    fn on_task_finished(&mut self, callback: TaskCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn set_local_handler(&mut self, handler: LocalHandler) {
        self.local_handler = Some(handler);
    }

    fn dispatch(&mut self, start: u64, end: u64) -> Result<()> {
        let config = &self.shared.config;
        let mut d = self.shared.lock();
        if d.state == MasterState::Shutdown {
            return Err(Error::InvalidState("master is shut down".into()));
        }

        let workers = d.workers.len().max(1);
        let tasks = if config.task_size > 0 {
            chunks(start, end, config.task_size)
        } else {
            partition(start, end, workers * config.tasks_per_worker.max(1))
        };

        if d.state != MasterState::Busy {
            // New pass.
            for slot in d.workers.values_mut() {
                slot.done.clear();
            }
            d.lost_results.clear();
        }
        d.state = MasterState::Busy;

        let _span = observability::span_master_pass(start, end).entered();
        for task in &tasks {
            let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
            d.queue.push_back(QueuedTask {
                id,
                task: *task,
                counted: false,
            });
            d.outstanding += 1;
        }
        tracing::info!(start, end, tasks = tasks.len(), workers = d.workers.len(), "dispatched range");
        d.wake_all();
        drop(d);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn notify_completed(&mut self) -> Result<()> {
        let replies: Vec<(u64, Receiver<Result<()>>)> = loop {
            self.wait_outstanding()?;
            let mut d = self.shared.lock();
            if d.outstanding > 0 {
                // A worker was lost after the queue drained; its ranges are back.
                continue;
            }
            d.state = MasterState::Completed;
            break d
                .workers
                .iter()
                .filter_map(|(id, slot)| {
                    let (tx, rx) = kanal::bounded(1);
                    slot.commands
                        .send(SessionInput::Complete(tx))
                        .ok()
                        .map(|()| (*id, rx))
                })
                .collect();
        };

        let timeout = self.shared.config.completion_timeout;
        let mut first_error = None;
        for (id, rx) in replies {
            if let Err(e) = recv_reply(&rx, timeout, "completion") {
                tracing::warn!(worker = id, error = %e, "worker did not acknowledge completion");
                first_error.get_or_insert(e);
            }
        }
        self.flush_events();
        tracing::info!("pass completed");
        first_error.map_or(Ok(()), Err)
    }

    fn gather_result(&mut self, registry: &mut ComponentRegistry, loc: &str) -> Result<()> {
        registry.resolve(loc)?;

        let replies: Vec<(u64, Receiver<Result<Vec<u8>>>)> = {
            let d = self.shared.lock();
            if !d.lost_results.is_empty() {
                return Err(Error::ConnectionLost(format!(
                    "results of worker(s) {} were lost",
                    d.lost_results.join(", ")
                )));
            }
            d.workers
                .iter()
                .filter_map(|(id, slot)| {
                    let (tx, rx) = kanal::bounded(1);
                    slot.commands
                        .send(SessionInput::Gather {
                            locator: loc.to_string(),
                            reply: tx,
                        })
                        .ok()
                        .map(|()| (*id, rx))
                })
                .collect()
        };

        // Every partial is received and combined before the target is touched,
        // so a failed gather leaves it unchanged.
        let timeout = self.shared.config.completion_timeout;
        let mut partials = Vec::with_capacity(replies.len());
        for (id, rx) in replies {
            let data = recv_reply(&rx, timeout, "gather")?;
            let partial = serial::from_bytes(registry, &data)?.ok_or_else(|| {
                Error::DeserializationFormat(format!("worker {id} sent an absent component"))
            })?;
            tracing::debug!(worker = id, loc, bytes = data.len(), "received partial result");
            partials.push((id, partial));
        }

        let target_key = registry.resolve(loc)?.key().to_string();
        if let Some((id, partial)) = partials.iter().find(|(_, p)| p.key() != target_key) {
            return Err(Error::Protocol(format!(
                "worker {id} sent a '{}' for '{loc}', expected '{target_key}'",
                partial.key()
            )));
        }

        let count = partials.len();
        let mut partials = partials.into_iter();
        let Some((_, mut total)) = partials.next() else {
            return Ok(());
        };
        for (id, partial) in partials {
            total.get_mut().accumulate(partial.get()).inspect_err(|e| {
                tracing::warn!(worker = id, loc, error = %e, "incompatible partial result");
            })?;
        }
        registry.resolve_mut(loc)?.get_mut().accumulate(total.get())?;
        tracing::debug!(loc, workers = count, "merged partial results");
        Ok(())
    }

    fn wait_for_workers(&self, count: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut d = self.shared.lock();
        while d.workers.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TaskTimeout(format!(
                    "{} of {count} worker(s) connected",
                    d.workers.len()
                )));
            }
            d = self
                .shared
                .changed
                .wait_timeout(d, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(d.workers.len())
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.shared
            .lock()
            .workers
            .values()
            .map(|slot| slot.info.clone())
            .collect()
    }

    fn print_worker_info(&self) {
        let workers = self.workers();
        tracing::info!(count = workers.len(), "connected workers");
        for w in workers {
            let state = w.current.map_or_else(|| "idle".to_string(), |t| format!("busy {t}"));
            tracing::info!(
                id = w.id,
                name = %w.name,
                peer = %w.peer,
                processed = w.processed,
                state = %state,
                "worker"
            );
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut d = self.shared.lock();
            d.state = MasterState::Shutdown;
            for slot in d.workers.values() {
                let _ = slot.commands.send(SessionInput::Close);
            }
        }
        self.shared.changed.notify_all();

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let _ = self.shared.events.send(Event::Stop);
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
        tracing::info!(addr = %self.local_addr, "master shut down");
        Ok(())
    }
}

impl Drop for TcpMaster {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for TcpMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMaster")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn run_events(rx: Receiver<Event>, callbacks: Arc<Mutex<Vec<TaskCallback>>>) {
    while let Ok(event) = rx.recv() {
        match event {
            Event::Progress(processed) => {
                let mut callbacks = callbacks.lock().unwrap_or_else(PoisonError::into_inner);
                for callback in callbacks.iter_mut() {
                    callback(processed);
                }
            }
            Event::Flush(reply) => {
                let _ = reply.send(());
            }
            Event::Stop => break,
        }
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let session_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("lumen-session-{peer}"))
                    .spawn(move || run_session(session_shared, stream, peer));
                match spawned {
                    Ok(handle) => sessions.push(handle),
                    Err(e) => tracing::error!(peer = %peer, error = %e, "failed to spawn session"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(shared.config.poll_interval);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                thread::sleep(shared.config.poll_interval);
            }
        }
        sessions.retain(|h| !h.is_finished());
    }
    for handle in sessions {
        let _ = handle.join();
    }
}

fn run_session(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let _span = observability::span_worker_session(&peer.to_string()).entered();
    match Session::handshake(Arc::clone(&shared), stream, peer) {
        Ok(Some(mut session)) => session.run(),
        Ok(None) => {}
        Err(e) => tracing::warn!(peer = %peer, error = %e, "worker handshake failed"),
    }
}

/// Master side of one worker connection.
struct Session {
    shared: Arc<Shared>,
    id: u64,
    writer: TcpStream,
    inputs: Receiver<SessionInput>,
    reader: Option<JoinHandle<()>>,
    last_seen: Instant,
    pending_complete: Option<Sender<Result<()>>>,
    pending_gather: VecDeque<Sender<Result<Vec<u8>>>>,
}

impl Session {
    fn handshake(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr) -> Result<Option<Self>> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(shared.config.handshake_timeout))?;

        let name = match protocol::read_message(&mut stream)? {
            Some(Message::Hello { name, version }) if version == protocol::VERSION => name,
            Some(Message::Hello { version, .. }) => {
                let reason = format!("unsupported protocol version {version}");
                protocol::write_message(&mut stream, &Message::Reject { reason })?;
                return Ok(None);
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected hello, got {}",
                    other.kind()
                )));
            }
            None => return Ok(None),
        };

        if !shared.allow.load(Ordering::SeqCst) || shared.shutdown.load(Ordering::SeqCst) {
            tracing::info!(peer = %peer, name = %name, "refusing worker");
            let reason = "connections are not allowed".to_string();
            protocol::write_message(&mut stream, &Message::Reject { reason })?;
            return Ok(None);
        }
        stream.set_read_timeout(None)?;

        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = kanal::unbounded();
        let mut reader_stream = stream.try_clone()?;
        let reader_tx = tx.clone();

        let sync_state = {
            let mut d = shared.lock();
            d.workers.insert(
                id,
                WorkerSlot {
                    info: WorkerInfo {
                        id,
                        name: name.clone(),
                        peer,
                        processed: 0,
                        current: None,
                    },
                    current: None,
                    done: Vec::new(),
                    commands: tx,
                },
            );
            observability::record_workers_connected(d.workers.len());
            d.sync_state.clone()
        };

        let reader = thread::Builder::new()
            .name(format!("lumen-reader-{id}"))
            .spawn(move || {
                loop {
                    let result = protocol::read_message(&mut reader_stream);
                    let done = !matches!(result, Ok(Some(_)));
                    if reader_tx.send(SessionInput::Net(result)).is_err() || done {
                        break;
                    }
                }
            });

        let mut session = Self {
            shared: Arc::clone(&shared),
            id,
            writer: stream,
            inputs: rx,
            reader: None,
            last_seen: Instant::now(),
            pending_complete: None,
            pending_gather: VecDeque::new(),
        };
        session.reader = match reader {
            Ok(handle) => Some(handle),
            Err(e) => {
                let e = Error::Io(e);
                session.close(&e);
                return Err(e);
            }
        };

        let greeted = session
            .send(&Message::Welcome { worker_id: id })
            .and_then(|()| match sync_state {
                Some(state) => session.send(&Message::Sync {
                    state: state.as_ref().clone(),
                }),
                None => Ok(()),
            });
        if let Err(e) = greeted {
            session.close(&e);
            return Err(e);
        }

        tracing::info!(worker = id, name = %name, peer = %peer, "worker connected");
        shared.changed.notify_all();
        Ok(Some(session))
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        protocol::write_message(&mut self.writer, msg)
    }

    fn run(&mut self) {
        let poll = self.shared.config.poll_interval;
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                let _ = self.send(&Message::Shutdown);
                self.close(&Error::InvalidState("master shut down".into()));
                return;
            }
            if self.timed_out() {
                self.close(&Error::TaskTimeout(format!(
                    "worker {} silent for {:?}",
                    self.id,
                    self.last_seen.elapsed()
                )));
                return;
            }
            // Inputs queued before the next task (a sync in particular) must
            // reach the worker first.
            loop {
                match self.inputs.try_recv() {
                    Ok(Some(input)) => {
                        if let Err(e) = self.step(input) {
                            self.close(&e);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        self.close(&Error::ConnectionLost("session channel closed".into()));
                        return;
                    }
                }
            }
            if let Err(e) = self.try_assign() {
                self.close(&e);
                return;
            }

            let input = match self.inputs.recv_timeout(poll) {
                Ok(input) => input,
                Err(ReceiveErrorTimeout::Timeout) => continue,
                Err(_) => {
                    self.close(&Error::ConnectionLost("session channel closed".into()));
                    return;
                }
            };
            if let Err(e) = self.step(input) {
                self.close(&e);
                return;
            }
        }
    }

    fn step(&mut self, input: SessionInput) -> Result<()> {
        match input {
            SessionInput::Net(Ok(Some(msg))) => {
                self.last_seen = Instant::now();
                self.handle(msg)
            }
            SessionInput::Net(Ok(None)) => Err(Error::ConnectionLost(format!(
                "worker {} closed the connection",
                self.id
            ))),
            SessionInput::Net(Err(e)) => Err(e),
            SessionInput::Wake => Ok(()),
            SessionInput::Send(msg) => self.send(&msg),
            SessionInput::Complete(reply) => {
                self.pending_complete = Some(reply);
                self.send(&Message::Completed)
            }
            SessionInput::Gather { locator, reply } => {
                self.pending_gather.push_back(reply);
                self.send(&Message::GatherRequest { locator })
            }
            SessionInput::Close => {
                let _ = self.send(&Message::Shutdown);
                Err(Error::InvalidState("master shut down".into()))
            }
        }
    }

    /// Hand the next queued task to this worker if it is idle.
    fn try_assign(&mut self) -> Result<()> {
        let queued = {
            let mut d = self.shared.lock();
            let busy = d.workers.get(&self.id).is_none_or(|slot| slot.current.is_some());
            if busy {
                return Ok(());
            }
            let Some(queued) = d.queue.pop_front() else {
                return Ok(());
            };
            if let Some(slot) = d.workers.get_mut(&self.id) {
                slot.current = Some(queued);
                slot.info.current = Some(queued.task);
            }
            queued
        };
        self.last_seen = Instant::now();
        observability::record_tasks_dispatched(1);
        tracing::debug!(worker = self.id, task = %queued.task, "assigning task");
        self.send(&Message::Task {
            task_id: queued.id,
            start: queued.task.start,
            end: queued.task.end,
        })
    }

    fn timed_out(&self) -> bool {
        let has_task = self
            .shared
            .lock()
            .workers
            .get(&self.id)
            .is_some_and(|slot| slot.current.is_some());
        has_task && self.last_seen.elapsed() > self.shared.config.worker_timeout
    }

    fn handle(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::TaskDone { task_id, processed } => self.task_done(task_id, processed),
            Message::Heartbeat | Message::SyncAck => Ok(()),
            Message::CompletedAck => {
                if let Some(reply) = self.pending_complete.take() {
                    let _ = reply.send(Ok(()));
                }
                Ok(())
            }
            Message::GatherResult { data, .. } => {
                let reply = self.pending_gather.pop_front().ok_or_else(|| {
                    Error::Protocol("unsolicited gather result".into())
                })?;
                let _ = reply.send(Ok(data));
                Ok(())
            }
            Message::Error { code, message } if code == codes::NOT_FOUND => {
                let reply = self.pending_gather.pop_front().ok_or_else(|| {
                    Error::Protocol(format!("unsolicited error: {message}"))
                })?;
                let _ = reply.send(Err(Error::Protocol(format!(
                    "worker {}: {message}",
                    self.id
                ))));
                Ok(())
            }
            Message::Error { code, message } => Err(Error::Protocol(format!(
                "worker {} reported error {code}: {message}",
                self.id
            ))),
            Message::Shutdown => Err(Error::ConnectionLost(format!(
                "worker {} shut down",
                self.id
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected {} from worker",
                other.kind()
            ))),
        }
    }

    fn task_done(&mut self, task_id: u64, processed: u64) -> Result<()> {
        let counted = {
            let mut d = self.shared.lock();
            let slot = d
                .workers
                .get_mut(&self.id)
                .ok_or_else(|| Error::InvalidState("worker is no longer registered".into()))?;
            let mut queued = match slot.current {
                Some(q) if q.id == task_id => q,
                _ => {
                    return Err(Error::Protocol(format!(
                        "completion for unknown task {task_id}"
                    )));
                }
            };
            // The task stays current on error, so closing the session requeues it.
            let len = queued.task.len();
            if processed != len {
                return Err(Error::Protocol(format!(
                    "task {task_id} {} reported {processed} processed, expected {len}",
                    queued.task
                )));
            }
            slot.current = None;
            slot.info.current = None;
            slot.info.processed = slot.info.processed.saturating_add(len);
            let counted = queued.counted;
            queued.counted = true;
            slot.done.push(queued);
            d.outstanding = d.outstanding.saturating_sub(1);
            (!counted).then_some(len)
        };
        self.shared.changed.notify_all();
        if let Some(len) = counted {
            observability::record_tasks_completed(len);
            let _ = self.shared.events.send(Event::Progress(len));
        }
        Ok(())
    }

    /// Half-close and wait for the worker to hang up, so that nothing it
    /// sent (a late heartbeat) is left unread when the socket closes.
    fn drain(&mut self) {
        let _ = self.writer.shutdown(Shutdown::Write);
        let deadline = Instant::now() + self.shared.config.handshake_timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.inputs.recv_timeout(left) {
                Ok(SessionInput::Net(Ok(None) | Err(_))) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    /// Tear the connection down and deregister the worker.
    fn close(&mut self, reason: &Error) {
        self.shared.remove_worker(self.id, reason);
        if self.shared.shutdown.load(Ordering::SeqCst) {
            self.drain();
        }
        let _ = self.writer.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(reply) = self.pending_complete.take() {
            let _ = reply.send(Err(Error::ConnectionLost(reason.to_string())));
        }
        for reply in self.pending_gather.drain(..) {
            let _ = reply.send(Err(Error::ConnectionLost(reason.to_string())));
        }
    }
}
