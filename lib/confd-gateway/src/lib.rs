//! HTTP to FastCGI gateway.
//!
//! The monitoring agent can only speak HTTP, while php-fpm pools only expose their ping and status pages over FastCGI.
//! The gateway accepts `GET /php-fpm/{project}/{host}/{port}/{check_type}`, makes one FastCGI call to the pool at
//! `host:port`, and returns the response body unchanged.
#![deny(warnings)]

pub mod fastcgi;

mod handler;
pub use self::handler::GatewayAPIHandler;

mod upstream;
pub use self::upstream::{FastCgiUpstream, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamStage};
