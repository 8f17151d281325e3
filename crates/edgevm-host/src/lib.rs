//! Capability SDK toolkit for edgevm.
//!
//! Concrete SDKs (database, storage, pub/sub, ...) live outside the core
//! runtime. This crate provides what they share:
//!
//! - [`factory`]: The [`Factory`] contract, the `W_` export convention and
//!   [`FactoryPlugin`], which attaches a set of factories as one plugin
//! - [`handles`]: [`HandleArena`], small-integer handles for host objects
//! - [`codec`]: Guest-memory codecs reporting [`Errno`] codes
//!
//! # Method convention
//!
//! SDK methods take pointers into the caller's memory and return a single
//! `i32` errno, `0` on success. Results are written through out-pointers,
//! with a separate `*Size` method so the guest can allocate first.

pub mod codec;
pub mod factory;
pub mod handles;

pub use codec::Errno;
pub use factory::{EXPORT_PREFIX, Factory, FactoryConstructor, FactoryPlugin, export_name};
pub use handles::HandleArena;
