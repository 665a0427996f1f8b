pub use crate::error::{ClResult, Error};
pub use crate::ids::{ClientId, DocumentId, InstanceId};
pub use crate::principal::Principal;

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
