//! MeshRadio node daemon
//!
//! Wires a mesh node and its connection orchestrator to the outside world:
//! YAML configuration, a line console, an HTTP API, a SQLite discovery
//! directory and a WebSocket rendezvous server mode.

pub mod api;
pub mod config;
pub mod console;
pub mod inbox;
pub mod logging;
pub mod node;
pub mod rendezvous_server;
pub mod storage;
