//! Capability protocol client — JSON-RPC over stdio to provider processes.
//!
//! This module handles:
//! - Spawning provider child processes and tracking their exit
//! - JSON-RPC 2.0 communication over process stdio
//! - The initialize handshake and capability negotiation
//! - Listing tools/resources/prompts, calling tools, reading resources, ping
//!
//! The fleet engine only sees the [`CapabilityClient`] trait; the stdio
//! implementation is the default behind [`StdioClientFactory`].

pub mod client;
pub mod errors;
pub mod process;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{
    CapabilityClient, ClientFactory, ClientTimeouts, ConnectInfo, StdioCapabilityClient,
    StdioClientFactory,
};
pub use errors::ProtocolError;
pub use process::{ExitNotifier, ExitSignal, ProcessExit};
pub use types::{
    CallToolResult, PromptArgument, PromptInfo, ProviderCapabilities, ReadResourceResult,
    ResourceInfo, ServerInfo, ToolInfo,
};
