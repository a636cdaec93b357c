//! Prelude for common imports used throughout all flashdeck crates

pub use crate::error::{Error, Result};
pub use tracing::{debug, error, info, trace, warn};
