//! Synthetic data for demos and fixtures.

pub mod synthetic;
