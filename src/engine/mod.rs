//! Analysis engine: opaque database capability, schema probing, bounded
//! aggregation, and the isolated worker that runs it.

pub mod aggregate;
pub mod analysis;
pub mod database;
pub mod protocol;
pub mod schema;
pub mod worker;
