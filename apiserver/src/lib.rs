#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kubemem_runtime::{core, k8s, store, Api, Args, Builder, LogFormat, Server};
