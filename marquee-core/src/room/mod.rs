mod code;
mod operation;
mod state;

pub use code::*;
pub use operation::*;
pub use state::*;
