#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use nse_injector_core as core;

mod admission;
mod args;
mod metrics;
mod server;
mod trace;

pub use self::{
    admission::{Error, Mutate, MUTATE_PATH},
    args::Args,
    metrics::AdmissionMetrics,
    server::ServerArgs,
    trace::{TraceRequests, TraceRequestsLayer},
};
