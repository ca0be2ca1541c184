//! ---
//! courier_section: "04-delivery-core"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "At-least-once dispatcher with retry ledger, exponential backoff and dead-letter routing."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Delivery core: pulls envelopes from a message source, runs the business
//! handler, and settles each delivery as acknowledged, retried after an
//! exponential backoff, or routed to the dead-letter sink.

pub mod backoff;
pub mod dispatcher;
pub mod dlq;
pub mod emitter;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod runtime;

pub use backoff::BackoffPolicy;
pub use dispatcher::{DeliveryOutcome, Dispatcher, DispatcherOptions};
pub use dlq::DeadLetterListener;
pub use emitter::{BatchEmitter, BatchReport};
pub use error::{DispatchError, ErrorReporter, Result};
pub use handler::{handler_fn, FnHandler, MessageHandler, SimulatedFailureHandler};
pub use ledger::RetryLedger;
pub use runtime::{DeliveryRuntime, DeliveryRuntimeBuilder};
