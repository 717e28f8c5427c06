//! # vesc-link: VESC packet protocol and connection orchestration
//!
//! A transport-agnostic client for VESC motor controllers. The crate frames
//! and checksums packets, encodes and decodes the command set, and keeps a
//! single active connection to a controller over serial, TCP (direct or via a
//! relay hub), UDP, BLE or CAN.
//!
//! ## Architecture
//!
//! - **Protocol**: frame codec, payload buffers, command codec and the CAN
//!   forwarding proxy ([`protocol`])
//! - **Transport**: one [`transport::Link`] per physical connection, each with
//!   a reader task feeding [`transport::LinkEvent`]s
//! - **Interface**: a tokio reactor owning the link, the codec and the
//!   command dispatcher, driven through a cloneable [`InterfaceHandle`]
//! - **Jobs**: firmware upload ([`firmware`]) and autoconnect
//!   ([`autoconnect`]) built on the handle
//!
//! ## Configuration
//!
//! [`LinkConfig`] is read from `link.toml`; connection history and paired
//! devices live in [`ConnectionStore`], both under the platform data
//! directory `dev.hxyulin.vesc-link`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.vesc-link/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.vesc-link/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.vesc-link\`
//!
//! ## Example
//!
//! ```ignore
//! use vesc_link::{ConnectionStore, LinkConfig, VescInterface};
//! use vesc_link::autoconnect::{AutoconnectProbe, SystemCandidates};
//! use vesc_link::types::CancelToken;
//!
//! #[tokio::main]
//! async fn main() -> vesc_link::Result<()> {
//!     let config = LinkConfig::load_or_default(LinkConfig::default_path()?);
//!     let _guard = vesc_link::logging::init(&config.logging);
//!
//!     let store = ConnectionStore::load_or_default(ConnectionStore::default_path()?);
//!     let (worker, handle) = VescInterface::new(config.clone(), store);
//!     tokio::spawn(worker.run());
//!
//!     let source = SystemCandidates::from_handle(&handle, &config).await?;
//!     let probe = AutoconnectProbe::new(handle.clone(), &config, CancelToken::new());
//!     let found = probe.run(&source).await?;
//!     println!("Connected to {}", found.label);
//!     Ok(())
//! }
//! ```

pub mod autoconnect;
pub mod config;
pub mod error;
pub mod firmware;
pub mod interface;
pub mod logging;
pub mod params;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{ConnectionStore, LinkConfig};
pub use error::{LinkError, Result};
pub use firmware::{FirmwareUploadJob, FirmwareUploadStateMachine};
pub use interface::{EventKind, InterfaceEvent, InterfaceHandle, VescInterface};
pub use protocol::{CommPacketId, FrameCodec, Request, Response};
pub use transport::Endpoint;
pub use types::{ConnectionState, FwVersion};
