//! Core types shared by the in-memory API server.
//!
//! This crate holds everything that does not depend on the shape of a particular resource kind:
//!
//! - [`ResourceVersion`] and the injectable [`Sequence`] that hands them out;
//! - [`ObjectKey`], the storage key of an object (namespace + name, or name alone);
//! - the request [`Error`] taxonomy and the watch-terminal [`Closed`] conditions;
//! - the match engine: [`labels::Selector`], [`fields::Selector`] and [`Criteria`], evaluated
//!   against anything that implements [`Selectable`].
//!
//! The match engine is used identically for list filtering and watch filtering, so that an object
//! returned by a list is exactly an object whose changes a watch with the same criteria observes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod criteria;
mod error;
pub mod fields;
mod key;
pub mod labels;
mod version;

pub use self::{
    criteria::{Criteria, Selectable},
    error::{Closed, Error, Result},
    key::ObjectKey,
    version::{ResourceVersion, Sequence},
};
