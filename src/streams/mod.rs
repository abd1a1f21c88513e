//! The two stream sides of a consumer.
//!
//! The producer side is a set of shared, read-only handles to the incoming
//! simulcast encodings. The send side is a single owned outgoing stream
//! carrying whatever layer the consumer currently forwards.

mod producer;
pub use producer::ProducerRtpStream;

mod rtx_cache;

mod send;
pub use send::{SendStream, SendStreamParams};
