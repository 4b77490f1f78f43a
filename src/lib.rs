//! # dashgate
//!
//! Hosts the built dashboard and forwards its `/api` calls to the internal
//! API with a Google-signed identity token attached.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dashgate::{App, GatewayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new("http://localhost:5000", "http://localhost:5000")?
//!         .with_port(8080);
//!     let app = Arc::new(App::new(&config)?);
//!
//!     let server = Server::bind(config.listen_addr()).await?;
//!     server
//!         .run(move |req| {
//!             let app = Arc::clone(&app);
//!             async move { app.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod auth;
pub mod config;
pub mod context;
pub mod dns;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;
pub mod spa;

pub use app::{App, AppError};
pub use config::{ConfigError, GatewayConfig, TokenSource};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
