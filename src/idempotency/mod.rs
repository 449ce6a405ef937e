pub mod capture;
pub mod handler;
pub mod key_extractor;
pub mod record;
pub mod storage;

pub use capture::{capture_response, is_connection_takeover, CaptureBody};
pub use handler::{idempotency_middleware, Idempotency, IdempotencyConfig, Skipper};
pub use key_extractor::{KeyExtractor, KeyLookup, DEFAULT_KEY_LOOKUP};
pub use record::{record_key, IdempotencyRecord, RECORD_KEY_PREFIX};
pub use storage::{InMemoryRecordStore, RecordStore, RedisRecordStore};
