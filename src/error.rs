use thiserror::Error;

/// Errors arising when configuring or driving a [`SimulcastConsumer`].
///
/// Runtime packet drops (wrong layer, awaiting keyframe, codec reject) are
/// not errors. They are silent by design.
///
/// [`SimulcastConsumer`]: crate::SimulcastConsumer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The consumable encodings do not describe a valid simulcast setup.
    #[error("invalid consumable encodings: {0}")]
    InvalidEncodings(&'static str),

    /// The media codec has no simulcast encoding context.
    #[error("codec not supported for simulcast: {0}")]
    UnsupportedCodec(String),

    /// A control request carried a missing or malformed field.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
}
