//! A job-queue broker speaking the beanstalkd TCP protocol, dispatching every
//! command to a pluggable storage [`backend`].
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod server;
pub mod session;
pub mod types;
pub mod util;
