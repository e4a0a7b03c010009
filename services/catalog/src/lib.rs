//! Catalog Service
//!
//! Image upload and detection-result catalog. Users upload JPEG images, an
//! external inference process reports what it detected, and users browse
//! their own records through a filtered, cursor-paginated listing. Every
//! returned record carries a freshly signed, time-limited download link.
//!
//! ## Features
//!
//! - **Record Lifecycle**: records are created pending and move once to
//!   detected when an inference result arrives (over HTTP or Kafka)
//! - **Filtered Listing**: date range, label set and cursor predicates over a
//!   stable `(createdAt, id)` order, strictly scoped to the caller
//! - **Signed Links**: image URLs are signed per response and never stored
//! - **Pluggable Collaborators**: PostgreSQL, S3 and Kafka in production,
//!   in-memory implementations for local runs and tests
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API / results consumer
//!              │
//!              ▼
//!      ┌──────────────┐
//!      │ Catalog      │
//!      └──────────────┘
//!        │          │
//!        ▼          ▼
//! ┌────────────┐ ┌────────────┐
//! │ Lifecycle  │ │ Query      │◀── Filter Compiler
//! │ Manager    │ │ Engine     │
//! └────────────┘ └────────────┘
//!   │    │   │      │     │
//!   │    │   └──────┼─────┴──▶ URL Issuer ──▶ UrlSigner
//!   │    ▼          ▼
//!   │  BlobStore  RecordStore
//!   ▼
//! InferenceDispatcher
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod memory;
pub mod metadata_store;
pub mod perceptual_hash;
pub mod ports;
pub mod query_engine;
pub mod record;
pub mod results_consumer;
pub mod s3_store;
pub mod url_issuer;

pub use catalog::{Catalog, CatalogSettings, Collaborators, Upload};
pub use config::Config;
pub use error::{CatalogError, CatalogResult};
pub use filter::{FilterRequest, PageRequest, Predicate, SortDirection};
pub use query_engine::Page;
pub use record::{DetectionResult, Record, RecordView};
