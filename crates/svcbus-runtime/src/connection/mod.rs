//! Raw socket wrappers for the client and server roles

pub mod client;
pub mod server;

pub use client::ClientConnection;
pub use server::{split_accepted, AdmissionPolicy, CookieAllocator, ServerConnection};
