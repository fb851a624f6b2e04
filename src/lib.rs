//! Client bindings for the [Gearman](http://gearman.org/) job server.
//!
//! This crate implements the submission side of the Gearman binary
//! protocol: framing, per-task state tracking, and a single-threaded
//! engine that multiplexes many tasks over one or more non-blocking
//! server connections, delivering progress and completion callbacks as
//! responses arrive.
//!
//! # Submitting jobs
//!
//! Build a [`Client`], register at least one server, queue tasks, then
//! drive them with [`Client::run_tasks`]:
//!
//! ```no_run
//! use gearman_client::{Callbacks, Client};
//!
//! # fn main() -> Result<(), gearman_client::Error> {
//! let mut client = Client::new();
//! client.add_server("tcp://localhost:4730")?;
//!
//! client.add_task(
//!     "resize",
//!     None,
//!     Some(&b"image-4711"[..]),
//!     Callbacks::new()
//!         .on_status(|t| {
//!             println!("{}/{}", t.numerator(), t.denominator());
//!             Ok(())
//!         })
//!         .on_complete(|t| {
//!             println!("done: {} bytes", t.result().len());
//!             Ok(())
//!         }),
//! )?;
//!
//! client.run_tasks()?;
//! # Ok(())
//! # }
//! ```
//!
//! Background variants (`add_task_background` and friends) detach once the
//! server acknowledges the submission; their progress can later be queried
//! with [`Client::add_task_status`].
//!
//! # Blocking behavior
//!
//! `run_tasks` blocks until every task is terminal. With
//! [`ClientOptions::non_blocking`] set it instead returns
//! [`Error::IoWait`] whenever nothing can advance without waiting, letting
//! the caller interleave other work and re-enter later (or park in
//! [`Client::wait`]).
//!
//! A `Client` must stay on one thread; run several clients for
//! parallelism. There is no shared state between clients.

#![deny(missing_docs)]

mod client;
mod conn;
mod error;
pub mod proto;
mod task;

pub use client::{Client, ClientOptions};
pub use conn::{Connector, TcpConnector};
pub use error::{Error, Protocol};
pub use proto::{Priority, Schedule, UniqueId};
pub use task::{Callbacks, Task, TaskEvents, TaskHandle, TaskState};
