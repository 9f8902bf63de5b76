//! # roomshard - authoritative state engine for multiplayer roleplay spaces
//!
//! A shard holds a set of spaces (rooms) and the characters inside them. Clients send
//! actions, permission and modifier requests, and chat; the shard validates them
//! against the current snapshot, the target's permissions and every involved
//! character's modifier chain, then broadcasts the resulting delta.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roomshard::config::Config;
//! use roomshard::engine::{AssetCatalog, Shard, ShardStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("roomshard.toml").await?;
//!     let assets = Arc::new(AssetCatalog::load_from_json(&config.shard.assets_file)?);
//!     let store = ShardStore::open(config.shard.store_path())?;
//!     let mut shard = Shard::new(config.shard_settings(), store, assets);
//!     shard.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - snapshot, action pipeline, permissions, modifiers, spaces and the shard runtime
//! - [`config`] - TOML configuration and validation
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - log sanitizing helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │      Shard      │ ← routing, ticks, directory reconcile
//! └─────────────────┘
//!          │ one task per space
//! ┌─────────────────┐
//! │ SpaceSynchronizer│ ← pipeline, chat, broadcast
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   ShardStore    │ ← sled persistence
//! └─────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod logutil;
pub mod metrics;
