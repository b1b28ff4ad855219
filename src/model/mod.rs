pub mod patch;
pub mod port;

pub use patch::*;
pub use port::*;
