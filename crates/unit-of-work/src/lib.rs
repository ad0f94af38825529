//! Unit of Work for the saga orchestrator.
//!
//! A [`UnitOfWork`] opens a [`TransactionScope`] and hands it to a work
//! closure. Entity writes and domain events registered on the scope are
//! staged in memory and flushed in one storage transaction when the root
//! scope returns successfully. Any error, panic or cancellation discards
//! everything staged.
//!
//! Scopes nest: [`TransactionScope::execute`] opens a child whose record
//! links to its parent. A failing child discards its own staged work and
//! marks the whole tree rollback-only.

pub mod error;
pub mod observer;
pub mod record;
pub mod repository;
pub mod scope;
pub mod unit_of_work;

pub use error::{RepositoryError, Result, UnitOfWorkError};
pub use observer::{InMemoryTransactionLog, NoopObserver, TransactionObserver};
pub use record::{EventRecord, OperationKind, OperationRecord, TransactionRecord, TransactionStatus};
pub use repository::{Entity, InMemoryRepository, Repository, RepositoryExt};
pub use scope::TransactionScope;
pub use unit_of_work::UnitOfWork;
