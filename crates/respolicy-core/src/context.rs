//! Accessing the pipeline from components.

use std::cell::RefCell;
use std::rc::Rc;

use crate::component::Id;
use crate::event::{EventData, EventId};
use crate::pipeline::EventSender;

/// A facade for producing events and reading the pipeline clock from
/// components running on the pipeline thread.
#[derive(Clone)]
pub struct PipelineContext {
    sender: EventSender,
    name: String,
    names: Rc<RefCell<Vec<String>>>,
}

impl PipelineContext {
    pub(crate) fn new(sender: EventSender, name: &str, names: Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            sender,
            name: name.to_owned(),
            names,
        }
    }

    /// Returns the identifier of component associated with this context.
    pub fn id(&self) -> Id {
        self.sender.src()
    }

    /// Returns the name of component associated with this context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current pipeline time in seconds since start.
    pub fn time(&self) -> f64 {
        self.sender.time()
    }

    /// Returns the name of component by its identifier.
    pub fn lookup_name(&self, id: Id) -> String {
        self.names.borrow()[id as usize].clone()
    }

    /// Submits an event to the specified destination component.
    pub fn emit<T: EventData>(&self, data: T, dest: Id) -> EventId {
        self.sender.emit(data, dest)
    }

    /// Submits an event carrying a processing deadline, in seconds since
    /// pipeline start.
    pub fn emit_with_deadline<T: EventData>(&self, data: T, dest: Id, deadline: f64) -> EventId {
        self.sender.emit_with_deadline(data, dest, deadline)
    }

    /// Submits an event destined to this component itself.
    pub fn emit_self<T: EventData>(&self, data: T) -> EventId {
        self.sender.emit(data, self.id())
    }

    /// Returns a detached thread-safe sender submitting events as this
    /// component.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}
