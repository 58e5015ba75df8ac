//! Remote-store FUSE client: mounts a remote cloud-storage account as a
//! local POSIX filesystem. See SPEC_FULL.md for the full design.

pub mod cache;
pub mod client;
pub mod credentials;
pub mod error;
pub mod fs;
pub mod http;
pub mod retry;
pub mod wire;

#[cfg(test)]
pub mod testutil;
