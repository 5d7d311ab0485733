//! Atom Store — interns every distinct RDF term to a dense, stable
//! 64-bit [`AtomId`].
//!
//! Three memory-mapped files back one store:
//!
//! - `atoms.data` — an append-only log of length-prefixed term bytes.
//! - `atoms.offsets` — a dense array, indexed by [`AtomId`], of
//!   `(offset, length)` pairs into `atoms.data`.
//! - `atoms.hash` — an open-addressed hash table mapping a term's hash
//!   to the [`AtomId`] that owns it, used to deduplicate interning.
//!
//! Each file begins with a fixed 1 KiB header (see [`header`]).
//! Growth never invalidates a reader's in-flight view: readers hold a
//! cloned `Arc<Mmap>` for the duration of a scan (the "borrowed-handle"
//! discipline), and growth swaps in a new `Arc` behind a `RwLock` that
//! is held only long enough to clone it.

mod store;

pub use store::{AtomError, AtomId, AtomResult, AtomStore, AtomStoreOptions};
