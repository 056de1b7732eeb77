pub mod signature;
pub mod validator;

pub use signature::*;
pub use validator::*;
