#![warn(missing_docs)]
#![doc = include_str!("../readme.md")]

pub mod component;
pub mod context;
pub mod event;
pub mod handler;
pub mod log;
pub mod pipeline;
mod state;

pub use colored;
pub use component::Id;
pub use context::PipelineContext;
pub use event::{Event, Shutdown};
pub use handler::EventHandler;
pub use pipeline::{EventSender, Pipeline};
