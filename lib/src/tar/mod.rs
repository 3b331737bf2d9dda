//! # Filtered tar transfers
//!
//! Pack a subtree of a [`crate::target::Target`] into a tar stream, and
//! unpack a tar stream into one, both under the control of a
//! [`crate::filter::FilterSpec`].
//!
//! # Stream layout
//!
//! Entry names are relative to the target root of the filter spec, without
//! a leading `/`; directories carry a trailing `/`. The root itself is never
//! an entry. Entries are produced breadth-first with siblings sorted by
//! name, so the same tree always yields the same sequence of entries.
//!
//! Ownership is not carried: every entry has uid and gid 0. Hard links,
//! device nodes, fifos and sockets are not transferred.

mod export;
pub use export::*;
mod import;
pub use import::*;
