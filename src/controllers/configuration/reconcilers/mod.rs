pub mod gc;
pub mod latest;
pub mod revisions;
