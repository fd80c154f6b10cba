//! Operation dispatch for trove.
//!
//! The [`Dispatcher`] starts browse, search, query, resolve and storage
//! operations against one source or fans them out across many, and delivers
//! results to the caller as [`Chunk`]s. Every operation ends with exactly one
//! terminal chunk. Blocking (`*_sync`) and [`futures::Stream`] (`*_stream`)
//! forms are layered on the same callbacks.

mod chunk;
mod dispatcher;
mod multiple;
mod operation;
mod output;
mod paged;
mod relay;
mod resolve;
mod stream;
mod sync;

pub use chunk::{Chunk, ResultCallback};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use operation::OperationPhase;
pub use relay::{Job, MainLoop, Relay, RuntimeRelay};
pub use stream::ChunkStream;
