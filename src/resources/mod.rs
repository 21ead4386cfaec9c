pub mod conditions;
pub mod configurations;
pub mod revisions;
pub mod routes;
pub mod services;
