pub mod lifecycle;
pub mod replicaset;
