mod columnar;
mod dead_letter;
mod idempotency;
mod url;

pub use columnar::{ClickHouseStore, ColumnarError, ColumnarStore, InsertOptions, MemoryStore};
pub use dead_letter::{
    DeadLetterError, DeadLetterItem, DeadLetterQueue, MemoryDeadLetter, RedisDeadLetter,
};
pub use idempotency::{
    IdempotencyError, IdempotencyStore, MemoryIdempotency, RedisIdempotency, SetOutcome,
};
pub use url::{clickhouse_url_from_environment, redis_url_from_environment};
