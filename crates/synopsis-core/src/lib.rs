//! # Synopsis Core
//!
//! Runtime-agnostic logic for Synopsis: content identities, job records and
//! their status machine, parameter validation, text chunking, the [`store`]
//! abstraction and the pipeline capability traits.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem dependencies.
//! The `synopsis` app crate wires these pieces to a runtime, a database and
//! an HTTP surface.

pub mod capability;
pub mod chunk;
pub mod identity;
pub mod models;
pub mod params;
pub mod store;
