// rumblebot-common: shared models, trait contracts and the crate-wide Error.

pub mod error;
pub mod models;
pub mod traits;

pub use error::Error;
