mod filplus;
mod spade;
mod spcoverage;
mod statemarketdeals;
mod tasks;

pub use filplus::*;
pub use spade::*;
pub use spcoverage::*;
pub use statemarketdeals::*;
pub use tasks::*;
