//! Telemetry ingestion and device-state engine for solar-battery leaves
//! reporting through MQTT gateways.
//!
//! One [`connection::GatewayConnection`] per gateway feeds an
//! [`worker::IngestWorker`], which keeps that gateway's
//! [`registry::DeviceRegistry`] current and publishes
//! [`events::FleetEvent`]s. [`fleet::Fleet`] ties the gateways together and
//! [`web`] exposes it to operators.

pub mod chart;
pub mod commands;
pub mod config;
pub mod connection;
pub mod events;
pub mod fleet;
pub mod registry;
pub mod schema;
pub mod staleness;
pub mod topic;
pub mod web;
pub mod worker;
