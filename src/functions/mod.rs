pub mod conversations;
pub mod instances;
pub mod pairing;
pub mod sync;

pub use conversations::*;
pub use instances::*;
pub use pairing::*;
pub use sync::*;
