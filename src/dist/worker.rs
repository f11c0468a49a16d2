//! Worker role over TCP.

use super::config::WorkerConfig;
use super::protocol::{self, Message, codes};
use super::{CompletedCallback, TaskHandler, WorkerContext, WorkerState};
use crate::error::{Error, Result};
use crate::observability;
use crate::registry::ComponentRegistry;
use crate::serial;
use kanal::ReceiveErrorTimeout;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn send(writer: &Mutex<TcpStream>, msg: &Message) -> Result<()> {
    let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
    protocol::write_message(&mut *stream, msg)
}

/// Report `error` to the master, then hand it back.
fn report(writer: &Mutex<TcpStream>, code: u32, error: Error) -> Error {
    let _ = send(
        writer,
        &Message::Error {
            code,
            message: error.to_string(),
        },
    );
    error
}

/// Background thread keeping the master's liveness timer fresh during long tasks.
struct Heartbeat {
    stop: kanal::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(writer: Arc<Mutex<TcpStream>>, interval: Duration) -> Result<Self> {
        let (stop, stop_rx) = kanal::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("lumen-heartbeat".into())
            .spawn(move || {
                while let Err(ReceiveErrorTimeout::Timeout) = stop_rx.recv_timeout(interval) {
                    if let Err(e) = send(&writer, &Message::Heartbeat) {
                        tracing::debug!(error = %e, "heartbeat failed, stopping");
                        break;
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

/// Worker connecting to a master over TCP.
pub struct TcpWorker {
    config: WorkerConfig,
    state: WorkerState,
    worker_id: Option<u64>,
    handler: Option<TaskHandler>,
    completed: Vec<CompletedCallback>,
    metrics: observability::WorkerMetrics,
}

impl TcpWorker {
    /// Create a worker; nothing is connected until the event loop runs.
    pub fn new(config: WorkerConfig) -> Self {
        let metrics = observability::WorkerMetrics::new(&config.name);
        Self {
            config,
            metrics,
            state: WorkerState::Initialized,
            worker_id: None,
            handler: None,
            completed: Vec::new(),
        }
    }

    /// Identifier assigned by the master, once connected.
    pub fn worker_id(&self) -> Option<u64> {
        self.worker_id
    }

    /// Connect, retrying according to the reconnect policy.
    fn connect(&self) -> Result<TcpStream> {
        let policy = &self.config.reconnect;
        let mut attempt = 0;
        loop {
            match TcpStream::connect(&self.config.address) {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        address = %self.config.address,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed to connect to master, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::ConnectionLost(format!(
                        "cannot reach master at {}: {e}",
                        self.config.address
                    )));
                }
            }
        }
    }

    fn handshake(&mut self, stream: &mut TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.handshake_timeout))?;
        protocol::write_message(
            stream,
            &Message::Hello {
                name: self.config.name.clone(),
                version: protocol::VERSION,
            },
        )?;
        match protocol::read_message(stream)? {
            Some(Message::Welcome { worker_id }) => {
                self.worker_id = Some(worker_id);
            }
            Some(Message::Reject { reason }) => {
                return Err(Error::Protocol(format!("rejected by master: {reason}")));
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "expected welcome, got {}",
                    other.kind()
                )));
            }
            None => {
                return Err(Error::ConnectionLost(
                    "master closed the connection during handshake".into(),
                ));
            }
        }
        stream.set_read_timeout(None)?;
        Ok(())
    }

    fn serve(
        &mut self,
        stream: &mut TcpStream,
        writer: &Mutex<TcpStream>,
        registry: &mut ComponentRegistry,
    ) -> Result<()> {
        loop {
            let Some(msg) = protocol::read_message(stream)? else {
                return Err(Error::ConnectionLost("master closed the connection".into()));
            };
            match msg {
                Message::Sync { state } => {
                    match serial::from_bytes(registry, &state) {
                        Ok(Some(root)) => {
                            registry.register_root(root);
                        }
                        Ok(None) => {
                            registry.take_root();
                        }
                        Err(e) => return Err(report(writer, codes::INTERNAL, e)),
                    }
                    tracing::debug!(bytes = state.len(), "applied master state");
                    send(writer, &Message::SyncAck)?;
                }
                Message::Task {
                    task_id,
                    start,
                    end,
                } => {
                    let Some(processed) = end.checked_sub(start) else {
                        let e = Error::Protocol(format!(
                            "task {task_id} has an inverted range [{start}, {end})"
                        ));
                        return Err(report(writer, codes::PROTOCOL, e));
                    };
                    let Some(handler) = self.handler.as_mut() else {
                        let e = Error::InvalidState("no task handler registered".into());
                        return Err(report(writer, codes::TASK_FAILED, e));
                    };
                    self.state = WorkerState::ProcessingTask;
                    tracing::debug!(task_id, start, end, "processing task");
                    if let Err(e) = handler(registry, start, end) {
                        tracing::error!(task_id, error = %e, "task handler failed");
                        self.metrics.record_failure();
                        return Err(report(writer, codes::TASK_FAILED, e));
                    }
                    self.state = WorkerState::Idle;
                    self.metrics.record_task(processed);
                    send(writer, &Message::TaskDone { task_id, processed })?;
                }
                Message::Completed => {
                    for callback in self.completed.iter_mut() {
                        callback(registry);
                    }
                    send(writer, &Message::CompletedAck)?;
                }
                Message::GatherRequest { locator } => {
                    let data = registry
                        .resolve(&locator)
                        .and_then(|ptr| serial::to_bytes(Some(ptr)));
                    let reply = match data {
                        Ok(data) => Message::GatherResult {
                            locator,
                            data: data.to_vec(),
                        },
                        Err(e) => Message::Error {
                            code: codes::NOT_FOUND,
                            message: e.to_string(),
                        },
                    };
                    send(writer, &reply)?;
                }
                Message::Shutdown => {
                    tracing::info!("master requested shutdown");
                    return Ok(());
                }
                other => {
                    let e = Error::Protocol(format!("unexpected {} from master", other.kind()));
                    return Err(report(writer, codes::PROTOCOL, e));
                }
            }
        }
    }
}

impl WorkerContext for TcpWorker {
    fn state(&self) -> WorkerState {
        self.state
    }

    fn register_task_handler(&mut self, handler: TaskHandler) {
        self.handler = Some(handler);
    }

    fn on_process_completed(&mut self, callback: CompletedCallback) {
        self.completed.push(callback);
    }

    fn run_event_loop(&mut self, registry: &mut ComponentRegistry) -> Result<()> {
        let _span = observability::span_worker_session(&self.config.name).entered();
        let mut stream = self.connect()?;
        self.handshake(&mut stream)?;
        self.state = WorkerState::Connected;
        tracing::info!(
            address = %self.config.address,
            worker_id = self.worker_id,
            "connected to master"
        );

        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let heartbeat = Heartbeat::start(Arc::clone(&writer), self.config.heartbeat_interval)?;
        let result = self.serve(&mut stream, &writer, registry);
        heartbeat.stop();
        let _ = stream.shutdown(Shutdown::Both);
        self.state = WorkerState::Disconnected;

        match &result {
            Ok(()) => tracing::info!("worker event loop finished"),
            Err(e) => tracing::warn!(error = %e, "worker event loop ended"),
        }
        result
    }
}

impl std::fmt::Debug for TcpWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpWorker")
            .field("address", &self.config.address)
            .field("name", &self.config.name)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::ReconnectPolicy;
    use std::net::TcpListener;

    #[test]
    fn test_unreachable_master() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut worker = TcpWorker::new(
            WorkerConfig::default()
                .with_address(addr.to_string())
                .with_reconnect(ReconnectPolicy::never()),
        );
        let mut registry = ComponentRegistry::new();
        assert!(matches!(
            worker.run_event_loop(&mut registry),
            Err(Error::ConnectionLost(_))
        ));
        assert_eq!(worker.state(), WorkerState::Initialized);
    }

    #[test]
    fn test_rejected_by_master() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let master = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let hello = protocol::read_message(&mut stream).unwrap().unwrap();
            assert!(matches!(hello, Message::Hello { .. }));
            protocol::write_message(
                &mut stream,
                &Message::Reject {
                    reason: "full".into(),
                },
            )
            .unwrap();
        });

        let mut worker = TcpWorker::new(WorkerConfig::default().with_address(addr.to_string()));
        let mut registry = ComponentRegistry::new();
        let err = worker.run_event_loop(&mut registry).unwrap_err();
        assert!(err.to_string().contains("full"));
        master.join().unwrap();
    }

    #[test]
    fn test_serves_tasks_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let master = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            protocol::read_message(&mut stream).unwrap().unwrap();
            protocol::write_message(&mut stream, &Message::Welcome { worker_id: 9 }).unwrap();
            protocol::write_message(
                &mut stream,
                &Message::Task {
                    task_id: 1,
                    start: 10,
                    end: 25,
                },
            )
            .unwrap();
            let done = loop {
                match protocol::read_message(&mut stream).unwrap().unwrap() {
                    Message::Heartbeat => continue,
                    other => break other,
                }
            };
            protocol::write_message(&mut stream, &Message::Shutdown).unwrap();
            done
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = TcpWorker::new(WorkerConfig::default().with_address(addr.to_string()));
        let sink = Arc::clone(&seen);
        worker.register_task_handler(Box::new(move |_, start, end| {
            sink.lock().unwrap().push((start, end));
            Ok(())
        }));
        let mut registry = ComponentRegistry::new();
        worker.run_event_loop(&mut registry).unwrap();

        assert_eq!(worker.worker_id(), Some(9));
        assert_eq!(worker.state(), WorkerState::Disconnected);
        assert_eq!(*seen.lock().unwrap(), vec![(10, 25)]);
        assert_eq!(
            master.join().unwrap(),
            Message::TaskDone {
                task_id: 1,
                processed: 15
            }
        );
    }

    #[test]
    fn test_inverted_task_range_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let master = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            protocol::read_message(&mut stream).unwrap().unwrap();
            protocol::write_message(&mut stream, &Message::Welcome { worker_id: 1 }).unwrap();
            protocol::write_message(
                &mut stream,
                &Message::Task {
                    task_id: 3,
                    start: 10,
                    end: 5,
                },
            )
            .unwrap();
            loop {
                match protocol::read_message(&mut stream).unwrap().unwrap() {
                    Message::Heartbeat => continue,
                    other => break other,
                }
            }
        });

        let calls = Arc::new(Mutex::new(0));
        let mut worker = TcpWorker::new(WorkerConfig::default().with_address(addr.to_string()));
        let counter = Arc::clone(&calls);
        worker.register_task_handler(Box::new(move |_, _, _| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        let mut registry = ComponentRegistry::new();
        assert!(matches!(
            worker.run_event_loop(&mut registry),
            Err(Error::Protocol(_))
        ));
        assert_eq!(*calls.lock().unwrap(), 0);
        match master.join().unwrap() {
            Message::Error { code, message } => {
                assert_eq!(code, codes::PROTOCOL);
                assert!(message.contains("inverted"));
            }
            other => panic!("expected an error report, got {other:?}"),
        }
    }
}
