mod bitswap;
mod graphsync;
mod host;
mod http;
pub mod pb;
mod transports;
mod traverse;

pub use bitswap::*;
pub use graphsync::*;
pub use host::*;
pub use http::*;
pub use transports::*;
pub use traverse::*;
