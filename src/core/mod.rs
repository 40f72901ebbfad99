pub mod message;
pub mod pool;
