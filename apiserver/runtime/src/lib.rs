//! Runs the in-memory API server: configuration, logging, views and typed clients.
//!
//! The server performs no transport of its own. It owns the store, the views over it and the
//! metrics registry, and hands out [`Api`] clients that drive the store the way a `kube` client
//! drives a real control plane.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod api;
mod args;
mod server;

pub use self::{
    api::{Api, WatchError},
    args::{Args, LogFormat},
    server::{Builder, Server},
};
pub use kubemem_core as core;
pub use kubemem_k8s_api as k8s;
pub use kubemem_k8s_store as store;
