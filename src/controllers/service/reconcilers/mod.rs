pub mod aggregate;
pub mod children;
