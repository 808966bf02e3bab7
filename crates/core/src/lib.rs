pub mod config;
pub mod data;
pub mod distributed;
pub mod head;
pub mod knn;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod momentum;
pub mod optim;
pub mod schedule;
pub mod trainer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
