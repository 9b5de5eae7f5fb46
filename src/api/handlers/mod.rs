pub mod proxy;
pub mod scanner;
