//! OpenState - Path-addressable client-side data synchronization
//!
//! This library keeps a coherent local picture of remote resources:
//! per-path confirmed state, an editable draft with retained change
//! detection, status flags, and validation rejections, all kept
//! consistent under concurrent async reads, writes, and edits.
//!
//! # High-Level API
//!
//! Register a [`router::Descriptor`] per resource type, then drive
//! everything through [`OpenState`]:
//!
//! ```ignore
//! use openstate::{OpenState, Descriptor};
//! use std::sync::Arc;
//!
//! let engine = OpenState::new();
//! engine.register(Descriptor::new("post", "/posts/:id", Arc::new(PostHandler))?)?;
//!
//! let state = engine.read("/posts/1").await?;
//! let draft = engine.draft("/posts/1")?;
//! draft.set("title", "edited")?;
//! let saved = engine.write("/posts/1").await?;
//! ```

pub mod change;
pub mod draft;
pub mod error;
pub mod events;
pub mod handler;
pub mod metastate;
pub mod router;
pub mod store;
pub mod validation;

pub use change::{ChangeKind, ChangeSet};
pub use draft::DraftHandle;
pub use error::{Error, Result};
pub use events::EventKind;
pub use handler::{PathContext, ResourceHandler};
pub use metastate::Metastate;
pub use router::{Descriptor, PathParams, PathPattern, DEADEND};
pub use store::{OpenState, ReadOptions, ReadStats, StoreConfig};
pub use validation::ValidationHandle;

/// Version of the OpenState library.
///
/// The version is defined in `Cargo.toml` and injected at compile
/// time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
