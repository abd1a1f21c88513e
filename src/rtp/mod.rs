//! RTP level types: stream/payload identifiers, the packet passed through
//! the forwarder, the sequence rewriter and the RTCP data the engine
//! consumes and produces.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

mod seq;
pub use seq::SeqRewriter;

mod rtcp;
pub use rtcp::{
    KeyFrameRequestKind, Nack, NackEntry, ReceiverReport, SdesChunk, SenderReport,
};

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl $id {
            /// Creates a new random id.
            pub fn new() -> Self {
                $id(rand::random::<$t>())
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Synchronization source.
///
/// Uniquely identifies a sending source of data. Each producer encoding has
/// its own (mapped) SSRC; the consumer puts a single output SSRC on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

/// Payload type.
///
/// Identifies which codec and format parameters a stream is sent with.
/// PTs in RTP headers are 7 bits. Values >= 128 are not valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pt(u8);
num_id!(Pt, u8);

/// Number of leading payload bytes a codec context may rewrite in place.
///
/// All supported payload descriptors fit inside this prefix, so saving it is
/// enough to restore the packet after a send.
const DESCRIPTOR_PREFIX_MAX: usize = 16;

/// A parsed RTP packet traveling through the forwarder.
///
/// Wire parsing and serialization happen upstream. The forwarder only reads
/// and rewrites header fields, and lets the codec context rewrite the
/// payload descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Sender source identifier.
    pub ssrc: Ssrc,

    /// Type of payload being carried.
    pub payload_type: Pt,

    /// Sequence number increasing by 1 for each RTP packet.
    pub sequence_number: u16,

    /// Timestamp in media time. The time base depends on the codec.
    pub timestamp: u32,

    /// For video, signifies the end of a series of packets that together
    /// form a single frame.
    pub marker: bool,

    /// Codec payload, starting at the payload descriptor.
    pub payload: Vec<u8>,

    /// Original fields saved while the packet is rewritten for sending.
    snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    ssrc: Ssrc,
    sequence_number: u16,
    timestamp: u32,
    descriptor: Vec<u8>,
}

impl RtpPacket {
    pub fn new(
        ssrc: Ssrc,
        payload_type: Pt,
        sequence_number: u16,
        timestamp: u32,
        payload: Vec<u8>,
    ) -> Self {
        RtpPacket {
            ssrc,
            payload_type,
            sequence_number,
            timestamp,
            marker: false,
            payload,
            snapshot: None,
        }
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Save the fields the forwarder is about to rewrite.
    ///
    /// Must be paired with [`RtpPacket::restore`] on every exit path, so the
    /// caller that handed us the packet observes no side effect.
    pub(crate) fn save(&mut self) {
        let prefix = self.payload.len().min(DESCRIPTOR_PREFIX_MAX);

        self.snapshot = Some(Snapshot {
            ssrc: self.ssrc,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            descriptor: self.payload[..prefix].to_vec(),
        });
    }

    /// Restore the fields saved by [`RtpPacket::save`].
    pub(crate) fn restore(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };

        self.ssrc = snapshot.ssrc;
        self.sequence_number = snapshot.sequence_number;
        self.timestamp = snapshot.timestamp;
        self.payload[..snapshot.descriptor.len()].copy_from_slice(&snapshot.descriptor);
    }
}
