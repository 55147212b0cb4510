//! Identity cache and mount lifecycle of a 9P filesystem client.
//!
//! The wire protocol is spoken by a `ProtocolClient` implementation supplied by
//! the caller. This crate keeps exactly one local `CachedFile` per remote file
//! identity, translates the attribute replies of both 9P2000.L and 9P2000.u
//! into one `FileAttributes` shape, and drives a mount through its lifecycle
//! with `MountController`, including forced unmounts that retry until the cache
//! drains.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub use p9_abi::{Fid, ProtocolVariant, Qid, QidType, RawStat, StatDotl, Wstat};

mod attr;
pub use attr::{AttrError, FileAttributes, FileType};

mod cache;
pub use cache::{Closed, Drain, IdentityCache};

mod client;
pub use client::ProtocolClient;

mod error;
pub use error::{Error, Result};

mod identity;
pub use identity::{CacheKey, FileIdentity};

mod interrupt;
pub use interrupt::{Interrupter, IntervalPause, Pause};

mod mount;
pub use mount::{MountController, MountState, UnmountReport};

mod node;
pub use node::{Backing, CachedFile};

pub mod options;
pub use options::MountOptions;

mod session;
pub use session::Session;
