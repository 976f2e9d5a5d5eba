//! Store and provisioner implementations.
//!
//! [`memory`] keeps everything in process memory. It backs the test suites
//! and is usable wherever a node agent runs without a cluster API (single-node
//! setups, simulations).

pub mod memory;
