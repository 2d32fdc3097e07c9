pub mod config;
pub mod fork;
pub mod graph;
pub mod ops;
pub mod scheduler;
pub mod server;
pub mod testutil;
pub mod thread;
pub mod trx;
