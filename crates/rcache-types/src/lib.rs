//! Plain-data model shared by the rcache crates.

pub mod descriptor;
pub mod fingerprint;
pub mod kind;
pub mod mask;
pub mod value;

pub use descriptor::{CallDescriptor, SequenceEntry, SequenceSeed};
pub use fingerprint::Fingerprint;
pub use kind::RecordKind;
pub use mask::IgnoreMask;
pub use value::{Kwargs, Value, kwargs};
