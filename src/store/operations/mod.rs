pub mod deliveries;
pub mod papers;
pub mod subscribers;
