//! relayc loads a neural-network model (textual IR or a serialized
//! TensorFlow graph), binds its weights into the module as constants, runs
//! a fixed sequence of graph-level simplification passes and writes the
//! resulting textual IR to a file.

pub mod cli;
pub mod driver;
pub mod exporter;
pub mod ir;
pub mod loader;
pub mod optimizer;
