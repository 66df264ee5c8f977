//! # resolver-context
//!
//! Client-side query context for a DNS stub resolver library.
//!
//! A [`Context`] tracks outstanding resolution requests issued by any number
//! of application threads and hands them to a single background worker over
//! a pair of framed pipes: one carrying requests to the worker, one carrying
//! results back. Results are matched to their caller by query id and
//! delivered either to a blocked caller ([`Context::resolve`]) or to a
//! callback ([`Context::resolve_async`]).
//!
//! ## Quick start
//!
//! ```rust
//! use resolver_context::{Answer, Context, ContextConfig, Query, RecordClass, RecordType};
//!
//! let ctx = Context::new(ContextConfig::new(), |q: &Query| -> resolver_context::Result<Answer> {
//!     Ok(Answer::for_query(q).with_data([192, 0, 2, 1]))
//! })?;
//!
//! // Blocking.
//! let answer = ctx.resolve("example.test", RecordType::A, RecordClass::IN)?;
//! assert!(answer.havedata);
//!
//! // Callback, delivered by `wait` (or `process` from an event loop).
//! ctx.resolve_async("example.test", RecordType::A, RecordClass::IN, |outcome| {
//!     println!("{outcome:?}");
//! })?;
//! ctx.wait()?;
//! # Ok::<(), resolver_context::ContextError>(())
//! ```
//!
//! ## Finalization
//!
//! Options may be changed until the first query. That query (or an explicit
//! [`Context::finalize`]) builds the module pipeline, reserves the shared
//! caches and starts the worker, exactly once, after which options return
//! [`ContextError::AfterFinal`].
//!
//! ## Concurrency modes
//!
//! [`ConcurrencyMode::ThreadBased`] runs the worker as a thread and lets the
//! application threads drain results. [`ConcurrencyMode::ProcessBased`] runs
//! an isolated worker that only talks through the pipes, plus a dispatcher
//! thread that drains results and runs callbacks.
//!
//! ## Cancellation
//!
//! [`Context::cancel`] forgets an async query; the worker still finishes it,
//! and the late answer is discarded.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod channel;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod query;
pub mod registry;
pub mod util;
pub mod wire;
pub mod worker;

pub use config::{ConcurrencyMode, ContextConfig, LocalData};
pub use context::Context;
pub use env::{ModuleEnv, ModuleStack, Resolve};
pub use error::{ChannelError, ContextError, ErrorCode, Result};
pub use query::{Answer, Query, RecordClass, RecordType};
pub use registry::QueryId;
pub use worker::WorkerLink;
