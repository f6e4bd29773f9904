mod codec;
mod envelope;
mod messages;

pub use codec::*;
pub use envelope::*;
pub use messages::*;
