mod location;
mod protocols;
mod provider;

pub use location::*;
pub use protocols::*;
pub use provider::*;
