//! Backend selection.

mod wrr;

pub use wrr::Balancer;
