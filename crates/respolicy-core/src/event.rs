//! Pipeline events.

use downcast_rs::{impl_downcast, Downcast};
use dyn_clone::{clone_trait_object, DynClone};
use serde::ser::Serialize;

use crate::component::Id;

/// Event identifier.
///
/// Events are numbered sequentially in submission order, starting from 0.
pub type EventId = u64;

/// Trait that should be implemented by event payloads.
///
/// Payloads cross the thread boundary between event producers (I/O workers,
/// the config watcher) and the pipeline worker, hence the `Send` bound.
pub trait EventData: Downcast + DynClone + erased_serde::Serialize + Send {}

impl_downcast!(EventData);

clone_trait_object!(EventData);

erased_serde::serialize_trait_object!(EventData);

impl<T: Serialize + DynClone + Send + 'static> EventData for T {}

/// Representation of an event travelling through the pipeline.
///
/// Events are delivered to the destination component strictly in submission
/// order; there is no reordering and no delayed delivery.
#[derive(Clone)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Time of event submission, in seconds since pipeline start.
    pub time: f64,
    /// Identifier of the event source.
    pub src: Id,
    /// Identifier of the event destination.
    pub dest: Id,
    /// Optional processing deadline, in seconds since pipeline start.
    ///
    /// The destination component is expected to abort and roll back any
    /// half-applied work if the deadline has passed by the time the step
    /// completes.
    pub deadline: Option<f64>,
    /// Event payload.
    pub data: Box<dyn EventData>,
}

impl Eq for Event {}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Payload instructing the pipeline worker to stop after the current event.
#[derive(Clone)]
pub struct Shutdown {}

impl Serialize for Shutdown {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit_struct("Shutdown")
    }
}
