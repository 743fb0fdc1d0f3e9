//! Adapters for the ports: in-memory, PostgreSQL and NATS.
pub mod events;
pub mod memory;
pub mod postgres;
