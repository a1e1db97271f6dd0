pub mod backend;
pub mod health;
