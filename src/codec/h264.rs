use super::{EncodingContextParams, LayerState};

const NALU_TYPE_MASK: u8 = 0x1f;

const NALU_IDR: u8 = 5;
const NALU_SPS: u8 = 7;
const NALU_STAP_A: u8 = 24;
const NALU_FU_A: u8 = 28;

/// Detect whether an H.264 RTP payload starts a keyframe.
///
/// A keyframe is an IDR or SPS NALU, either as a single NALU payload,
/// aggregated in a STAP-A, or at the start of an FU-A fragment series.
pub(crate) fn is_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }

    let nalu_type = payload[0] & NALU_TYPE_MASK;

    match nalu_type {
        NALU_IDR | NALU_SPS => true,
        NALU_STAP_A => {
            // STAP-A: repeated [16 bit size][NALU].
            let mut idx = 1;
            while idx + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[idx], payload[idx + 1]]) as usize;
                let nalu = payload[idx + 2] & NALU_TYPE_MASK;
                if nalu == NALU_IDR || nalu == NALU_SPS {
                    return true;
                }
                idx += 2 + size;
            }
            false
        }
        NALU_FU_A => {
            // FU-A: FU indicator + FU header. S bit marks the fragment start.
            let Some(fu_header) = payload.get(1) else {
                return false;
            };
            let start = fu_header & 0x80 != 0;
            start && (fu_header & NALU_TYPE_MASK) == NALU_IDR
        }
        _ => false,
    }
}

/// H.264 layer filter.
///
/// The packetization this engine forwards carries no temporal scalability
/// info, so there is nothing to drop or rewrite at the payload level: the
/// context pins the current temporal layer to 0 once packets flow.
#[derive(Debug)]
pub struct H264Context {
    pub(crate) layers: LayerState,
}

impl H264Context {
    pub fn new(params: EncodingContextParams) -> Self {
        H264Context {
            layers: LayerState::new(params),
        }
    }

    pub(crate) fn process_payload(&mut self, _payload: &mut [u8]) -> bool {
        if self.layers.current < 0 {
            self.layers.current = 0;
        }

        true
    }
}
