//! IPC server for the serving layer

pub mod protocol;
pub mod server;

pub use server::IpcServer;
