use crate::rtp::SeqRewriter;

use super::{EncodingContextParams, LayerState};

const PICTURE_ID_MAX: u64 = 1 << 15;

/// VP9 RTP payload descriptor (draft-ietf-payload-vp9).
///
/// ```text
///      +-+-+-+-+-+-+-+-+
///      |I|P|L|F|B|E|V|Z| (REQUIRED)
///      +-+-+-+-+-+-+-+-+
/// I:   |M| PICTURE ID  | (RECOMMENDED)
///      +-+-+-+-+-+-+-+-+
/// M:   | EXTENDED PID  | (RECOMMENDED)
///      +-+-+-+-+-+-+-+-+
/// L:   |  T  |U|  S  |D| (CONDITIONALLY RECOMMENDED)
///      +-+-+-+-+-+-+-+-+
///      |   TL0PICIDX   | (non-flexible mode only)
///      +-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Vp9Descriptor {
    /// Inter-picture predicted frame (not a keyframe) when set.
    inter_predicted: bool,

    /// Beginning of a frame.
    beginning_of_frame: bool,

    /// Picture id, 7 or 15 bit, if present.
    picture_id: Option<u16>,
    picture_id_15bit: bool,
    picture_id_offset: usize,

    /// Temporal layer id, if layer indices are present.
    tid: Option<u8>,

    /// Switching up point. Set when no upper-layer frame after this one
    /// depends on a frame before it, making it safe to step up.
    switching_up_point: bool,

    /// Spatial layer id.
    sid: u8,

    /// Inter-layer dependency. Set when this frame depends on the frame of
    /// the spatial layer below it.
    d: bool,

    /// Whether layer indices were present at all.
    has_layer_indices: bool,
}

fn parse(payload: &[u8]) -> Option<Vp9Descriptor> {
    if payload.is_empty() {
        return None;
    }

    let mut desc = Vp9Descriptor::default();

    let b0 = payload[0];
    let i = b0 & 0x80 != 0;
    let l = b0 & 0x20 != 0;

    desc.inter_predicted = b0 & 0x40 != 0;
    desc.beginning_of_frame = b0 & 0x08 != 0;

    let mut idx = 1;

    if i {
        let b = *payload.get(idx)?;
        desc.picture_id_offset = idx;
        if b & 0x80 != 0 {
            let b2 = *payload.get(idx + 1)?;
            desc.picture_id = Some((((b & 0x7f) as u16) << 8) | b2 as u16);
            desc.picture_id_15bit = true;
            idx += 2;
        } else {
            desc.picture_id = Some(b as u16);
            idx += 1;
        }
    }

    if l {
        let b = *payload.get(idx)?;
        desc.has_layer_indices = true;
        desc.tid = Some(b >> 5);
        desc.switching_up_point = b & 0x10 != 0;
        desc.sid = (b >> 1) & 0x07;
        desc.d = b & 0x01 != 0;
    }

    Some(desc)
}

/// Detect whether a VP9 RTP payload starts a keyframe.
///
/// Requires the inter-layer-dependency bit to be clear: a frame that
/// depends on a lower spatial layer is not independently decodable.
pub(crate) fn is_keyframe(payload: &[u8]) -> bool {
    let Some(desc) = parse(payload) else {
        return false;
    };

    !desc.inter_predicted
        && desc.beginning_of_frame
        && (desc.sid == 0 || !desc.has_layer_indices)
        && !desc.d
}

/// Temporal layer id of the payload, 0 when absent.
pub(crate) fn temporal_layer(payload: &[u8]) -> i16 {
    parse(payload).and_then(|d| d.tid).unwrap_or(0) as i16
}

/// VP9 layer filter.
///
/// Drops packets above the target temporal layer and rewrites the picture
/// id so the receiver sees contiguous values across drops and switches.
#[derive(Debug)]
pub struct Vp9Context {
    pub(crate) layers: LayerState,
    picture_id_rewriter: SeqRewriter<PICTURE_ID_MAX>,
    sync_next: bool,
}

impl Vp9Context {
    pub fn new(params: EncodingContextParams) -> Self {
        Vp9Context {
            layers: LayerState::new(params),
            picture_id_rewriter: SeqRewriter::new(),
            sync_next: true,
        }
    }

    pub(crate) fn sync_required(&mut self) {
        self.sync_next = true;
    }

    pub(crate) fn process_payload(&mut self, payload: &mut [u8]) -> bool {
        let Some(desc) = parse(payload) else {
            return true;
        };

        if self.sync_next {
            if let Some(pid) = desc.picture_id {
                self.picture_id_rewriter.sync(pid as u64 + PICTURE_ID_MAX - 1);
            }
            self.sync_next = false;
        }

        let target = self.layers.target;
        let current = self.layers.current;

        if let Some(tid) = desc.tid {
            let tid = tid as i16;

            if tid > target {
                self.drop_picture(&desc);
                return false;
            }

            // Stepping up requires a switching up point at the beginning of
            // a frame.
            if tid > current && !(desc.switching_up_point && desc.beginning_of_frame) {
                self.drop_picture(&desc);
                return false;
            }

            if tid > current {
                trace!("VP9 current temporal layer up to {}", tid);
                self.layers.current = tid;
            } else if current > target {
                trace!("VP9 current temporal layer down to {}", target);
                self.layers.current = target;
            }
        }

        self.rewrite(payload, &desc);

        true
    }

    fn drop_picture(&mut self, desc: &Vp9Descriptor) {
        if let Some(pid) = desc.picture_id {
            self.picture_id_rewriter.drop(pid as u64);
        }
    }

    fn rewrite(&mut self, payload: &mut [u8], desc: &Vp9Descriptor) {
        if let Some(pid) = desc.picture_id {
            let new_pid = self.picture_id_rewriter.input(pid as u64) as u16;

            if desc.picture_id_15bit {
                payload[desc.picture_id_offset] = 0x80 | (new_pid >> 8) as u8;
                payload[desc.picture_id_offset + 1] = (new_pid & 0xff) as u8;
            } else {
                payload[desc.picture_id_offset] = (new_pid & 0x7f) as u8;
            }
        }
    }
}
