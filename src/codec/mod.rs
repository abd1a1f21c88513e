//! Codec specific payload handling.
//!
//! The engine never decodes media. What it needs from the codec level is:
//! keyframe detection, the temporal layer a packet belongs to, and the
//! in-place payload descriptor rewrite that keeps picture ids contiguous
//! when higher temporal layers are dropped.

use crate::Error;

mod h264;
mod vp8;
mod vp9;

pub use h264::H264Context;
pub use vp8::Vp8Context;
pub use vp9::Vp9Context;

/// Video codecs this engine can forward with simulcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
}

impl Codec {
    /// Match a MIME type such as `video/VP8`. Case insensitive.
    pub fn from_mime(mime: &str) -> Option<Codec> {
        let mime = mime.to_ascii_lowercase();
        match mime.as_str() {
            "video/vp8" => Some(Codec::Vp8),
            "video/vp9" => Some(Codec::Vp9),
            "video/h264" => Some(Codec::H264),
            _ => None,
        }
    }
}

/// Construction parameters for an encoding context.
#[derive(Debug, Clone, Copy)]
pub struct EncodingContextParams {
    pub spatial_layers: i16,
    pub temporal_layers: i16,
}

/// Per-codec layer filter owned by a consumer.
///
/// Decides whether to forward or drop a packet based on the target temporal
/// layer, and reports the temporal layer currently being forwarded. A value
/// of `-1` means "no layer".
#[derive(Debug)]
pub enum EncodingContext {
    Vp8(Vp8Context),
    Vp9(Vp9Context),
    H264(H264Context),
}

impl EncodingContext {
    /// Create the context for the given MIME type.
    ///
    /// Fails for codecs that cannot be forwarded with simulcast.
    pub fn from_mime(mime: &str, params: EncodingContextParams) -> Result<Self, Error> {
        let codec = Codec::from_mime(mime).ok_or_else(|| Error::UnsupportedCodec(mime.into()))?;

        Ok(match codec {
            Codec::Vp8 => EncodingContext::Vp8(Vp8Context::new(params)),
            Codec::Vp9 => EncodingContext::Vp9(Vp9Context::new(params)),
            Codec::H264 => EncodingContext::H264(H264Context::new(params)),
        })
    }

    pub fn target_temporal_layer(&self) -> i16 {
        self.layers().target
    }

    pub fn set_target_temporal_layer(&mut self, layer: i16) {
        self.layers_mut().target = layer;
    }

    pub fn current_temporal_layer(&self) -> i16 {
        self.layers().current
    }

    pub fn set_current_temporal_layer(&mut self, layer: i16) {
        self.layers_mut().current = layer;
    }

    /// Tell the context the stream is re-anchoring (layer switch). Codecs
    /// with rewritten descriptor counters re-base them on the next packet.
    pub fn sync_required(&mut self) {
        match self {
            EncodingContext::Vp8(c) => c.sync_required(),
            EncodingContext::Vp9(c) => c.sync_required(),
            EncodingContext::H264(_) => {}
        }
    }

    /// Whether the payload starts a self-decodable frame.
    pub fn is_keyframe(&self, payload: &[u8]) -> bool {
        match self {
            EncodingContext::Vp8(_) => vp8::is_keyframe(payload),
            EncodingContext::Vp9(_) => vp9::is_keyframe(payload),
            EncodingContext::H264(_) => h264::is_keyframe(payload),
        }
    }

    /// Temporal layer the payload belongs to, or 0 when the codec or the
    /// descriptor carries no temporal info.
    pub fn temporal_layer(&self, payload: &[u8]) -> i16 {
        match self {
            EncodingContext::Vp8(_) => vp8::temporal_layer(payload),
            EncodingContext::Vp9(_) => vp9::temporal_layer(payload),
            EncodingContext::H264(_) => 0,
        }
    }

    /// Apply temporal-layer filtering to a payload, possibly rewriting its
    /// descriptor in place. Returns whether the packet should be forwarded.
    pub fn process_payload(&mut self, payload: &mut [u8]) -> bool {
        match self {
            EncodingContext::Vp8(c) => c.process_payload(payload),
            EncodingContext::Vp9(c) => c.process_payload(payload),
            EncodingContext::H264(c) => c.process_payload(payload),
        }
    }

    fn layers(&self) -> &LayerState {
        match self {
            EncodingContext::Vp8(c) => &c.layers,
            EncodingContext::Vp9(c) => &c.layers,
            EncodingContext::H264(c) => &c.layers,
        }
    }

    fn layers_mut(&mut self) -> &mut LayerState {
        match self {
            EncodingContext::Vp8(c) => &mut c.layers,
            EncodingContext::Vp9(c) => &mut c.layers,
            EncodingContext::H264(c) => &mut c.layers,
        }
    }
}

/// Target/current temporal layer shared by all codec contexts.
#[derive(Debug)]
pub(crate) struct LayerState {
    pub params: EncodingContextParams,
    pub target: i16,
    pub current: i16,
}

impl LayerState {
    fn new(params: EncodingContextParams) -> Self {
        LayerState {
            params,
            target: -1,
            current: -1,
        }
    }
}
