pub mod error;
pub mod ids;
pub mod principal;
pub mod prelude;
pub mod settings;

pub use error::{ClResult, Error};
pub use ids::{ClientId, DocumentId, InstanceId};
pub use principal::Principal;
pub use settings::Settings;

// vim: ts=4
