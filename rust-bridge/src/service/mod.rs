//! Service side of the bridge: consume requests, dispatch, reply.

pub mod consumer;
pub mod handler;
pub mod router;

pub use consumer::ServiceConsumer;
pub use handler::{handler_fn, Handler, HandlerFn, HandlerRequest, Reply};
pub use router::ActionRouter;
