//! cache-machine Core - Wire Types and Rules
//!
//! Pure data structures shared by every role: change records and their
//! validation, watch declarations, priming messages, topic naming, settings
//! and the error taxonomy. No I/O lives here.

pub mod config;
pub mod error;
pub mod naming;
pub mod protocol;
pub mod record;
pub mod watch;

pub use config::{CacheSettings, Role, DEFAULT_PRIME_TIMEOUT_MS};
pub use error::{
    CacheError, CacheResult, ConfigError, HandlerError, PrimingError, RecordError, SourceError,
    TransportError,
};
pub use naming::{
    truncate_identifier, Naming, TopicGranularity, MAX_SUBSCRIPTION_NAME_LEN, MODEL_TOPIC,
    PRIME_REQUEST_TOPIC, PRIME_RESPONSE_TOPIC, TOPIC_SEPARATOR,
};
pub use protocol::{PrimeModel, PrimeRequest};
pub use record::{decode_batch, encode_batch, ChangeRecord, MethodName, ModelId, WireRecord};
pub use watch::{EventKey, WatchMode, WatchSpec};
