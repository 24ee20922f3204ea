pub mod agent;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod deployment;
pub mod error;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod shutdown;
pub mod states;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("meadowgrid");
}
