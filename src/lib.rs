//! Simulcast RTP forwarding engine.
//!
//! One sender-facing endpoint receives multiple parallel encodings of the
//! same video source (spatial layers, each with temporal sub-layers) and
//! emits a single RTP stream to one remote consumer. The engine dynamically
//! chooses which incoming layer to forward based on observed stream health,
//! the bitrate budget handed down by an external congestion controller, and
//! the user's layer preference.
//!
//! Switching between input layers is seamless: sequence-number and timestamp
//! discontinuities are masked, frames are suppressed until a keyframe aligns
//! the switch, and timestamps are re-anchored across streams using
//! NTP-carrying RTCP sender reports.
//!
//! The crate is sans-IO and single-threaded. It does no socket work, no RTP
//! wire parsing and no congestion control of its own: packets come in as
//! parsed [`RtpPacket`] values, producer streams are observed through the
//! [`ProducerRtpStream`] trait, and everything the engine wants the
//! transport to do comes out through [`ConsumerListener`] callbacks and the
//! polled [`ConsumerEvent`] queue.

#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

mod error;
pub use error::Error;

mod util;

pub mod codec;
pub mod rtp;
pub mod streams;

mod consumer;
pub use consumer::{
    ConsumableEncoding, ConsumerEvent, ConsumerLayers, ConsumerListener, ConsumerOptions,
    MediaCodec, MediaKind, OutputEncoding, PreferredLayers, RequestMethod, RtcpFeedback,
    RtxParams, SimulcastConsumer,
};
