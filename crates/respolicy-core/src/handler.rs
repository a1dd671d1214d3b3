//! Event handling.

use crate::event::Event;

/// Trait for consuming events in pipeline components.
///
/// Handlers are invoked by the pipeline worker only, one event at a time.
/// There are no concurrent and no reentrant handler calls.
pub trait EventHandler {
    /// Processes an event.
    fn on(&mut self, event: Event);
}

/// Enables the use of pattern matching syntax for processing different types of events
/// by downcasting the event payload from [`EventData`](crate::event::EventData) to concrete types.
///
/// Match arms need not be exhaustive. If the event payload does not match any of the
/// specified arms, the macro logs the event as unhandled under `ERROR` level.
///
/// # Examples
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use serde::Serialize;
/// use respolicy_core::{cast, Event, EventHandler, Pipeline, PipelineContext};
///
/// #[derive(Clone, Serialize)]
/// pub struct SomeEvent {
///     some_field: u32,
/// }
///
/// pub struct Component {
///     state: u32,
///     ctx: PipelineContext,
/// }
///
/// impl EventHandler for Component {
///     fn on(&mut self, event: Event) {
///         cast!(match event.data {
///             SomeEvent { some_field } => {
///                 self.state = some_field;
///             }
///         })
///     }
/// }
///
/// let mut pipeline = Pipeline::new();
/// let comp_ctx = pipeline.create_context("comp");
/// let comp = Rc::new(RefCell::new(Component { state: 0, ctx: comp_ctx }));
/// let comp_id = pipeline.add_handler("comp", comp.clone());
/// let sender = pipeline.sender("runtime");
/// sender.emit(SomeEvent { some_field: 16 }, comp_id);
/// pipeline.step();
/// assert_eq!(comp.borrow().state, 16);
/// ```
#[macro_export]
macro_rules! cast {
    ( match $event:ident.data { $( $type:ident { $($tt:tt)* } => { $($expr:tt)* } )+ } ) => {
        $(
            if $event.data.is::<$type>() {
                if let Ok(__value) = $event.data.downcast::<$type>() {
                    let $type { $($tt)* } = *__value;
                    $($expr)*
                }
            } else
        )*
        {
            $crate::log::log_unhandled_event($event);
        }
    }
}
