//! # Filtered tar transfers
//!
//! This crate moves directory trees between storage backends and tar
//! streams. A [`filter::FilterSpec`] selects which paths take part and
//! where imported entries land; [`tar::pack`] and [`tar::unpack`] do the
//! work against any [`target::Target`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub mod error;
pub mod filter;
pub mod operation;
pub mod tar;
pub mod target;
mod tokio_util;
pub mod transfer;
