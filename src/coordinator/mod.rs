//! Coordinator side: lifecycle state machine, engine supervision, payload
//! validation, and the session that ties them together.

pub mod lifecycle;
pub mod messages;
pub mod session;
pub mod supervisor;
pub mod validate;
