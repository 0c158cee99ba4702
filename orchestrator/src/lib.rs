//! risectl library
//!
//! Deployment orchestration for containerized web services: a
//! declarative environment spec expands into a resource graph, the
//! engine converges live infrastructure onto it, releases push images
//! to the app repository, and deployments roll the service onto them.

pub mod artifacts;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod errors;
pub mod fsio;
pub mod graph;
pub mod logs;
pub mod models;
pub mod planner;
pub mod provider;
pub mod release;
pub mod rollout;
pub mod utils;
