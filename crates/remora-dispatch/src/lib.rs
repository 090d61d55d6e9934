//! Bounded-concurrency dispatch of independent async work items.
//!
//! [`BatchDispatcher::submit`] returns a [`BatchTicket`] immediately. At most
//! `batch_size` workers run at once; the rest wait in FIFO order. Every ticket
//! resolves on its own, so one failed item never affects another.
//!
//! ```no_run
//! use remora_dispatch::{join_all, BatchDispatcher};
//!
//! # async fn demo() {
//! let dispatcher = BatchDispatcher::on_current_runtime(5).unwrap();
//! let tickets = dispatcher.submit_all(0..100u32, |block| async move {
//!     Ok::<_, String>(block * 2)
//! });
//! let results = join_all(tickets).await;
//! assert_eq!(results.len(), 100);
//! # }
//! ```

pub mod error;
pub use error::{DispatchError, Result};

mod dispatcher;
pub use dispatcher::{BatchDispatcher, DispatchStats};

mod ticket;
pub use ticket::{join_all, BatchTicket};
