//! # trellis-web
//!
//! Platform assembly and HTTP boundary for Trellis.
//!
//! [`platform`] wires models, scripts, authentication and the scheduler into
//! one shared [`Platform`]; [`adapters::axum`] exposes it over HTTP:
//! `POST /token`, `GET|POST /graphql`, and the `/file/<Entity>` upload and
//! download surface.

pub mod adapters;
pub mod platform;

pub use adapters::axum::AxumAdapter;
pub use platform::{Platform, PlatformConfig, PlatformError};
