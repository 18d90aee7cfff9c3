//! OCR inference HTTP server.
//!
//! Exposes the `ocrd` pipeline over a small multi-protocol surface:
//!
//! - `GET /health` — liveness probe
//! - `GET /models` — ONNX models visible to the server
//! - `GET /metrics` — Prometheus text exposition
//! - `POST /ocr/image` — multipart image OCR (JSON / CSV / text / overlay PNG)
//! - `POST /ocr/pdf` — multipart PDF OCR (JSON / text)
//! - `POST /ocr/batch` — JSON batch of up to ten items
//! - `GET /ws/ocr` — bidirectional streaming OCR
//!
//! Per-request overrides (`language`, `dict`, `dict-langs`, `det-model`,
//! `rec-model`) are validated, fingerprinted and served from a
//! single-flight pipeline cache; requests without overrides reuse the
//! default pipeline built at startup. All endpoints sit behind CORS +
//! metrics middleware and an optional per-client rate limiter with daily
//! quotas.
//!
//! ```rust,no_run
//! use server::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load()?;
//!     server::start_server(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{build_router, start_server};
pub use state::ServerState;
