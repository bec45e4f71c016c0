//! HarborGate - a container-aware reverse proxy
//!
//! This library provides an edge gateway that:
//! - Watches a container engine and derives host-based routes from labels
//! - Terminates TLS with automatically issued certificates (ACME or
//!   self-signed), selected per SNI handshake
//! - Answers ACME HTTP-01 challenges and renews certificates in the
//!   background
//! - Optionally authenticates callers against an OpenID Connect provider
//!   with role-based route authorization
//! - Forwards traffic, including WebSocket upgrades, to backend containers

pub mod acme;
pub mod certstore;
pub mod challenges;
pub mod config;
pub mod docker;
pub mod error;
pub mod labels;
pub mod observer;
pub mod oidc;
pub mod provider;
pub mod proxy;
pub mod renewal;
pub mod routes;
pub mod server;
pub mod upstream;
