//! Pipeline configuration and execution.
//!
//! The pipeline is the single serialization point of the daemon: every
//! external stimulus (runtime request, config reload, internal policy event)
//! becomes an [`Event`] submitted through an [`EventSender`], and exactly one
//! worker loop pulls events off the queue and dispatches them to registered
//! handlers. Handlers therefore never observe concurrent or reentrant calls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use log::Level::Trace;
use log::{debug, log_enabled, trace};
use serde_json::json;
use serde_type_name::type_name;

use crate::component::Id;
use crate::context::PipelineContext;
use crate::event::{Event, EventData, EventId, Shutdown};
use crate::handler::EventHandler;
use crate::log::log_undelivered_event;
use crate::state::Clock;

/// Cloneable, thread-safe handle for submitting events into the pipeline.
///
/// This is the only surface that crosses thread boundaries. I/O workers and
/// the config watcher each hold a sender registered under their own
/// component name.
#[derive(Clone)]
pub struct EventSender {
    src: Id,
    tx: Sender<Event>,
    clock: Clock,
    counter: Arc<AtomicU64>,
}

impl EventSender {
    /// Submits an event without a deadline. Returns the event identifier.
    pub fn emit<T: EventData>(&self, data: T, dest: Id) -> EventId {
        self.submit(Box::new(data), dest, None)
    }

    /// Submits an event carrying a processing deadline, in seconds since
    /// pipeline start.
    pub fn emit_with_deadline<T: EventData>(&self, data: T, dest: Id, deadline: f64) -> EventId {
        self.submit(Box::new(data), dest, Some(deadline))
    }

    /// Returns the current pipeline time in seconds since start.
    pub fn time(&self) -> f64 {
        self.clock.time()
    }

    /// Returns the identifier this sender submits events as.
    pub fn src(&self) -> Id {
        self.src
    }

    fn submit(&self, data: Box<dyn EventData>, dest: Id, deadline: Option<f64>) -> EventId {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            time: self.clock.time(),
            src: self.src,
            dest,
            deadline,
            data,
        };
        if self.tx.send(event).is_err() {
            debug!(target: "pipeline", "event {} dropped, pipeline is gone", id);
        }
        id
    }
}

/// The serialized event queue and handler registry.
pub struct Pipeline {
    rx: Receiver<Event>,
    tx: Sender<Event>,
    clock: Clock,
    counter: Arc<AtomicU64>,
    name_to_id: HashMap<String, Id>,
    names: Rc<RefCell<Vec<String>>>,
    handlers: Vec<Option<Rc<RefCell<dyn EventHandler>>>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            rx,
            tx,
            clock: Clock::new(),
            counter: Arc::new(AtomicU64::new(0)),
            name_to_id: HashMap::new(),
            names: Rc::new(RefCell::new(Vec::new())),
            handlers: Vec::new(),
        }
    }

    fn register(&mut self, name: &str) -> Id {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.name_to_id.len() as Id;
        self.name_to_id.insert(name.to_owned(), id);
        self.names.borrow_mut().push(name.to_owned());
        self.handlers.push(None);
        id
    }

    /// Returns the identifier of component by its name.
    ///
    /// Panics if component with such name does not exist.
    pub fn lookup_id(&self, name: &str) -> Id {
        *self.name_to_id.get(name).unwrap()
    }

    /// Returns the name of component by its identifier.
    ///
    /// Panics if component with such id does not exist.
    pub fn lookup_name(&self, id: Id) -> String {
        self.names.borrow()[id as usize].clone()
    }

    /// Creates a context for a component running on the pipeline thread.
    pub fn create_context<S>(&mut self, name: S) -> PipelineContext
    where
        S: AsRef<str>,
    {
        let id = self.register(name.as_ref());
        let ctx = PipelineContext::new(self.make_sender(id), name.as_ref(), self.names.clone());
        debug!(
            target: "pipeline",
            "[{:.3} {} pipeline] Created context: {}",
            self.time(),
            crate::log::get_colored("DEBUG", colored::Color::Blue),
            json!({"name": ctx.name(), "id": ctx.id()})
        );
        ctx
    }

    /// Registers an external event source (an I/O worker, the config
    /// watcher) and returns its thread-safe sender.
    pub fn sender<S>(&mut self, name: S) -> EventSender
    where
        S: AsRef<str>,
    {
        let id = self.register(name.as_ref());
        self.make_sender(id)
    }

    fn make_sender(&self, src: Id) -> EventSender {
        EventSender {
            src,
            tx: self.tx.clone(),
            clock: self.clock,
            counter: self.counter.clone(),
        }
    }

    /// Registers the event handler for component with specified name,
    /// returns the component id.
    pub fn add_handler<S>(&mut self, name: S, handler: Rc<RefCell<dyn EventHandler>>) -> Id
    where
        S: AsRef<str>,
    {
        let id = self.register(name.as_ref());
        self.handlers[id as usize] = Some(handler);
        id
    }

    /// Returns the current pipeline time in seconds since start.
    pub fn time(&self) -> f64 {
        self.clock.time()
    }

    /// Processes the next queued event, if any, without blocking.
    ///
    /// Returns `true` if an event was processed.
    pub fn step(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(event) => {
                self.dispatch(event);
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Blocks up to `timeout` for the next event and processes it.
    ///
    /// Returns `true` if an event was processed.
    pub fn step_wait(&mut self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.dispatch(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Processes all currently queued events without blocking.
    ///
    /// Returns the number of processed events.
    pub fn drain(&mut self) -> u32 {
        let mut processed = 0;
        while self.step() {
            processed += 1;
        }
        processed
    }

    /// Runs the worker loop until a [`Shutdown`] event arrives or all
    /// senders are dropped.
    pub fn run(&mut self) {
        while let Ok(event) = self.rx.recv() {
            if event.data.is::<Shutdown>() {
                debug!(target: "pipeline", "shutdown requested by {}", self.lookup_name(event.src));
                break;
            }
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        if log_enabled!(Trace) {
            trace!(
                target: "pipeline",
                "[{:.3} {} pipeline] {}",
                self.time(),
                crate::log::get_colored("TRACE", colored::Color::Cyan),
                json!({"type": type_name(&event.data).unwrap_or("?"), "src": event.src, "dest": event.dest})
            );
        }
        let handler = self.handlers.get(event.dest as usize).and_then(|h| h.clone());
        match handler {
            Some(handler) => handler.borrow_mut().on(event),
            None => log_undelivered_event(event),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
