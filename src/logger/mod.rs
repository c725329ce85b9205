//! Structured activity logging: JSONL sink owned by a dedicated logger thread.

pub mod activity;
pub mod jsonl;
