//! Server side of the app-installation protocol.
//!
//! Clients discover the server over mDNS or a wired handshake, then speak a
//! framed JSON request/response protocol to install apps, manage
//! provisioning profiles and enable unsigned code execution on attached
//! devices. The crate also carries the developer disk download cache and the
//! zip codec for `.ipa` packages.
//!
//! Device access itself is a collaborator concern; see [`provider`] for the
//! traits a host embeds this crate behind.

pub mod archive;
pub mod connection;
pub mod developer_disk;
pub mod devices;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod provider;

pub use connection::ClientConnection;
pub use developer_disk::DeveloperDiskManager;
pub use devices::{Device, DeviceEvent, DeviceType, OsVersion};
pub use error::{ArchiveError, DeveloperDiskError, ServerError, SignError};
pub use manager::ConnectionManager;
