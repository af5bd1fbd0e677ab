pub mod clock;
pub mod environment;
pub mod error;
pub mod key;

pub use clock::{Clock, ManualClock, SystemClock, from_unix_millis, unix_millis};
pub use environment::{Environment, UnknownEnvironment};
pub use error::{Error, Result};
pub use key::{CacheKey, KeyBuilder};
