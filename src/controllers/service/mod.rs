pub mod controller;

pub use controller::run;

pub mod reconcilers;
