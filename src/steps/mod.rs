//! Steps: the executable units of a serving graph.
//!
//! A [`Step`] pairs a name with a [`StepKind`] (task, router, queue, or
//! error handler) plus addressing config. Task logic lives behind the
//! [`Handler`] trait; [`HandlerRegistry`] resolves handlers by name at
//! build time.

mod handler;
mod registry;
mod step;

pub use handler::{Handler, StepError};
pub use registry::{HandlerFactory, HandlerRegistry, RegistryError};
pub use step::{HandlerRef, RemoteSpec, RemoteTarget, Step, StepIo, StepKind};
