//! trove-core: the vocabulary shared by every trove crate.
//!
//! This crate holds the metadata-key registry, the media entity model,
//! capability declarations, operation options with their negotiation
//! against a [`Caps`], the unified error type and the configuration types.
//! It has no notion of sources or scheduling; those live in `trove-source`
//! and `trove-dispatch`.

pub mod caps;
pub mod config;
pub mod error;
pub mod ids;
pub mod keys;
pub mod media;
pub mod options;
pub mod value;

// Re-export the most commonly used items at the crate root.
pub use caps::{Caps, CapsOption, OperationKind, ResolutionFlags, SupportedOps, TypeFilter};
pub use error::{Error, Result};
pub use ids::*;
pub use keys::{system, KeyRegistry, KeyType, MetadataKey};
pub use media::{Media, MediaKind};
pub use options::{Count, Negotiated, Negotiation, OperationOptions, OptionField};
pub use value::{KeyFilter, Value};
