//! Multi-tenant reverse proxy for Claude-family, OpenAI-responses-family, and
//! Gemini-family upstream LLM APIs.
//!
//! The request-dispatch pipeline is organized as six components:
//! [`cache`] (sticky sessions, unavailability marks, concurrency slots),
//! [`accounts`] (durable account store + state machine), [`usage`] (atomic
//! usage/cost accumulation), [`adapters`] (per-provider request shaping and
//! SSE parsing), [`scheduler`] (account selection), and [`dispatcher`] (the
//! end-to-end request lifecycle). [`reconciler`] runs the periodic background
//! workers that tie the hot and cold stores together.

pub mod accounts;
pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod packages;
pub mod pricing;
pub mod reconciler;
pub mod scheduler;
pub mod usage;
pub mod users;

pub use config::Config;
pub use error::GatewayError;
