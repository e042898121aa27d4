//! `molflow-worker` wiring: store selection, provider registration and the
//! background loops that keep executions moving.

pub mod app;
