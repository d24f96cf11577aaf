//! Shared key-value backend abstraction for ModHub services.
//!
//! This crate provides the [`KvBackend`] trait and related types that the
//! trust-boundary pipeline uses for everything that must outlive a single
//! process: the shared identity-cache tier, rate-limit counters, and the
//! durable signing-secret record.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 modhub-guard                     │
//! │   TierCache (L2) │ RateLimiter │ SecretStore     │
//! ├──────────────────────────────────────────────────┤
//! │                modhub-storage                    │
//! │                KvBackend trait                   │
//! │  (get, set_with_ttl, compare_and_set,            │
//! │   increment_with_expiry, health_check)           │
//! ├──────────────┬───────────────────────────────────┤
//! │ MemoryBackend│   external shared store           │
//! │  (testing)   │   (production)                    │
//! └──────────────┴───────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use modhub_storage::{KvBackend, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"session:42".to_vec(), b"alice".to_vec()).await?;
//!     let value = backend.get(b"session:42").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"alice".to_vec()));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. Backends map their internal
//! failures to the standardized [`StorageError`] variants;
//! [`StorageError::is_transient`] distinguishes outages worth degrading
//! around from definitive answers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod health;
pub mod memory;

pub use backend::KvBackend;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use health::{HealthMetadata, HealthProbe, HealthStatus};
pub use memory::MemoryBackend;
