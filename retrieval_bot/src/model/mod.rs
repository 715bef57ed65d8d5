mod deal_state;
mod rpc;

pub use deal_state::*;
pub use rpc::*;
