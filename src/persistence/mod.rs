// ============================================================================
// Persistence
// ============================================================================
//
// - storage     - transactional storage capability + error types
// - transaction - TransactionRunner (timeout / retry / parallel / batch)
// - postgres    - sqlx-backed storage
// - memory      - in-process storage for local runs and tests
//
// ============================================================================

pub mod memory;
pub mod postgres;
pub mod storage;
pub mod transaction;

pub use memory::{InMemoryStorage, MemoryTx};
pub use postgres::PgStorage;
pub use storage::{OutboxRepository, StorageError, TransactionError, TransactionalStorage, TxFuture};
pub use transaction::{batch_op, parallel_op, BatchOp, ParallelOp, TransactionRunner};
