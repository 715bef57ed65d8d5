mod bitswap;
mod graphsync;
mod http;
mod stub;

pub use bitswap::BitswapProbe;
pub use graphsync::GraphsyncProbe;
pub use http::HttpProbe;
pub use stub::StubProbe;
