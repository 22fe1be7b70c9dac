//! flowrunner accepts record batches over a libp2p overlay, runs them through
//! a transform flow and writes the results to PostgreSQL.

pub mod config;
pub mod db;
pub mod ingest;
pub mod invoke;
pub mod job;
pub mod pipeline;
pub mod records;
pub mod supervisor;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod testing;
