//! IPC bridge between the pool and subprocess execution contexts.
//!
//! - **protocol**: message types exchanged over a context's stdin/stdout
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
