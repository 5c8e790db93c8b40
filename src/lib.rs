//! `janus`: a bridge between two host runtimes.
//!
//! A server process exports objects, classes, and named locks over a
//! length-framed binary protocol; a client process manipulates them
//! through handles as though they were native. The bridge preserves
//! object identity (handles are reference-counted and identity-stable),
//! exception semantics (a failure raised inside a nested callback crosses
//! every hop back to the original call site), and a logical-thread model
//! that lets a chain of calls weaving between the two processes reenter
//! the locks it already holds.
//!
//! The main subsystems, bottom-up: [`transport`] carries bytes,
//! [`protocol`] and [`codec`] frame and tag them, [`types`] and
//! [`resolve`] pick overloads by relative specificity, [`coerce`] moves
//! values between the type systems (with a shared-memory fast path in
//! [`shm`]), [`lock`] provides deadlock-detected named locks over logical
//! threads ([`logical`]), [`pool`] and [`dispatch`] run the
//! request/response loop, and [`server`] / [`client`] are the two ends of
//! a session. The host's reflection facility is abstracted behind
//! [`runtime::HostRuntime`]; [`runtime::Registry`] is the builder-based
//! native implementation.

pub mod client;
pub mod codec;
pub mod coerce;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod handles;
pub mod lock;
pub mod logical;
pub mod messages;
pub mod pool;
pub mod protocol;
pub mod resolve;
pub mod runtime;
pub mod server;
pub mod session;
pub mod shm;
pub mod transport;
pub mod types;
