//! podkit-http: JSON-RPC over HTTP for pod nodes.
//!
//! ```no_run
//! use podkit_core::PodRpc;
//! use podkit_http::HttpRpcClient;
//!
//! # async fn run() -> Result<(), podkit_core::TransportError> {
//! let rpc = PodRpc::new(HttpRpcClient::default_for("https://rpc.v1.dev.pod.network")?);
//! println!("gas price: {} wei", rpc.gas_price().await?);
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{HttpClientConfig, HttpRpcClient};
