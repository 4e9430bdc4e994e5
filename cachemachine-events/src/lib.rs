//! cache-machine Events - Model Event Dispatch
//!
//! Applications that only need to react to changes (rather than read a
//! replica) list `Model.method` keys and supply an [`EventHandler`].

pub mod dispatcher;
pub mod handler;

pub use dispatcher::{DispatchOutcome, DispatchReport, EventDispatcher};
pub use handler::{handler_fn, ErrorHandler, EventHandler, HandlerFn, ModelEvent};
