//! kuberun: a per-connection Kubernetes pod backend for SSH servers.
//!
//! Every accepted SSH connection gets its own [`session::ConnectionSession`].
//! After a successful handshake it provisions a dedicated pod, waits for the
//! pod to become ready and hands back a [`session::SessionHandle`] that channel
//! requests are dispatched through. On disconnect the pod is torn down.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod pod;
pub mod session;
