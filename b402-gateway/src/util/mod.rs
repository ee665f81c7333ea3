//! Process utilities of the gateway binary.

mod shutdown;

pub use shutdown::ShutdownSignal;
