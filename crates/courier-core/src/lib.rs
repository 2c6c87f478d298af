//! Core domain models, storage, and time primitives.
//!
//! Provides the message model and its status state machine, the PostgreSQL
//! repository that enforces conditional status transitions, and the clock
//! abstraction the scheduler runs on. All other crates depend on these
//! foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Message, MessageId, MessageStats, MessageStatus, Page, PageRequest, SentMessageCache,
};
pub use time::{Clock, RealClock, TestClock};
