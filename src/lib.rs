#![forbid(unsafe_code)]

//! Run CGI programs behind a streaming, in-process gateway interface.
//!
//! ```rust,ignore
//! use cgi_bridge::{CgiBridge, GatewayRequest};
//!
//! let bridge = CgiBridge::new("/usr/lib/cgi-bin/gitweb.cgi")?;
//! let body = bridge
//!     .respond(GatewayRequest::new(environ), |status, headers| {
//!         println!("{status} {headers:?}");
//!     })
//!     .await;
//! ```

pub mod bridge;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod http;

pub use bridge::response::{BridgeEvent, CgiResponse, ResponseBody};
pub use bridge::CgiBridge;
pub use config::BridgeConfig;
pub use errors::{AppError, Result};
pub use gateway::{ErrorSink, GatewayRequest};
