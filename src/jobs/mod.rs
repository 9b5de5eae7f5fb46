//! Long-running background jobs owned by the service manager

pub mod cidr;
pub mod http_test;
pub mod scanner;

pub use http_test::HttpTestJob;
pub use scanner::ScannerJob;
