//! trove-source: the source contract and the source registry.
//!
//! A [`Source`] exposes browse/search/query/resolve/store operations and
//! answers through sinks. The [`Registry`] owns the metadata key table and
//! the set of registered sources, orders them by rank and partitions key
//! lists against a source's declared keys. [`MemorySource`] is a complete
//! in-memory source used by bundled catalogs and tests.

pub mod events;
pub mod memory;
pub mod ranks;
pub mod registry;
pub mod sink;
pub mod source;

pub use events::{EventBus, RegistryEvent};
pub use memory::{Execution, MemorySource, MemorySourceBuilder};
pub use ranks::{RankTable, RANKS_ENV};
pub use registry::{KeyPartition, Registry};
pub use sink::{Delivery, ReplySink, ResultSink};
pub use source::{
    BrowseRequest, MediaFromUriRequest, QueryRequest, RemoveRequest, ResolveRequest,
    SearchRequest, Source, SourceInfo, StoreMetadataRequest, StoreRequest,
};
