//! Data model: resource descriptors and release artifacts

pub mod artifact;
pub mod balancer;
pub mod cicd;
pub mod compute;
pub mod network;
pub mod resource;
