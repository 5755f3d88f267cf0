//! toolmesh: a client for many MCP tool servers at once.
//!
//! Servers are reached over a stdio subprocess pipe or streamable HTTP. Their
//! catalogs are merged under a collision policy, calls are routed by exposed
//! name, and an orchestrator drives a decision-maker through a bounded
//! decide/call loop.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolmesh::prelude::*;
//!
//! # async fn example() -> toolmesh::error::Result<()> {
//! let config = ToolMeshConfig::discover()?;
//! let client = Arc::new(MultiServerClient::initialize(&config).await?);
//! let decision_maker = Arc::new(ChatDecisionMaker::from_config(&config.decision)?);
//!
//! let orchestrator = Orchestrator::new(Arc::clone(&client), decision_maker, config.agent.clone());
//! let outcome = orchestrator.run(TaskRequest::new("What is 4*5+20?")).await;
//! println!("{:?}", outcome.answer);
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod decision;
pub mod error;
pub mod mcp;
pub mod prelude;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
