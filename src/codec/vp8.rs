use crate::rtp::SeqRewriter;

use super::{EncodingContextParams, LayerState};

const PICTURE_ID_MAX: u64 = 1 << 15;
const TL0_IDX_MAX: u64 = 1 << 8;

/// VP8 RTP payload descriptor, RFC 7741 section 4.2.
///
/// ```text
///       0 1 2 3 4 5 6 7
///      +-+-+-+-+-+-+-+-+
///      |X|R|N|S|R| PID | (REQUIRED)
///      +-+-+-+-+-+-+-+-+
/// X:   |I|L|T|K| RSV   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// I:   |M| PictureID   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// L:   |   tl0picidx   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// T/K: |tid|Y| KEYIDX  | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Vp8Descriptor {
    /// Start of VP8 partition with partition index 0. Only such packets
    /// carry the VP8 payload header.
    start_of_frame: bool,

    /// Picture id, 7 or 15 bit, if present.
    picture_id: Option<u16>,
    picture_id_15bit: bool,
    picture_id_offset: usize,

    /// Temporal level zero index, if present.
    tl0_pic_idx: Option<u8>,
    tl0_pic_idx_offset: usize,

    /// Temporal layer index, if the T bit is set.
    tid: Option<u8>,

    /// Layer sync bit. Set when this frame depends only on tl0 frames,
    /// which makes it a safe point to step up a temporal layer.
    layer_sync: bool,

    /// Offset of the VP8 payload header (on start-of-frame packets).
    header_offset: usize,
}

fn parse(payload: &[u8]) -> Option<Vp8Descriptor> {
    if payload.is_empty() {
        return None;
    }

    let mut desc = Vp8Descriptor::default();

    let b0 = payload[0];
    let x = b0 & 0x80 != 0;
    let s = b0 & 0x10 != 0;
    let pid = b0 & 0x07;

    desc.start_of_frame = s && pid == 0;

    let mut idx = 1;

    if x {
        let ext = *payload.get(idx)?;
        idx += 1;

        let i = ext & 0x80 != 0;
        let l = ext & 0x40 != 0;
        let t = ext & 0x20 != 0;
        let k = ext & 0x10 != 0;

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
            desc.tl0_pic_idx = Some(*payload.get(idx)?);
            desc.tl0_pic_idx_offset = idx;
            idx += 1;
        }

        if t || k {
            let b = *payload.get(idx)?;
            if t {
                desc.tid = Some(b >> 6);
                desc.layer_sync = b & 0x20 != 0;
            }
            idx += 1;
        }
    }

    if idx >= payload.len() {
        return None;
    }
    desc.header_offset = idx;

    Some(desc)
}

/// Detect whether a VP8 RTP payload starts a keyframe.
///
/// Only the first packet of a frame (S=1, PID=0) contains the VP8 payload
/// header, whose P bit is 0 for keyframes.
pub(crate) fn is_keyframe(payload: &[u8]) -> bool {
    let Some(desc) = parse(payload) else {
        return false;
    };

    desc.start_of_frame && payload[desc.header_offset] & 0x01 == 0
}

/// Temporal layer index of the payload, 0 when absent.
pub(crate) fn temporal_layer(payload: &[u8]) -> i16 {
    parse(payload).and_then(|d| d.tid).unwrap_or(0) as i16
}

/// VP8 layer filter.
///
/// Beyond dropping packets above the target temporal layer, the context
/// rewrites `PictureID` and `TL0PICIDX` in place so the receiver sees
/// contiguous values across drops and stream switches.
#[derive(Debug)]
pub struct Vp8Context {
    pub(crate) layers: LayerState,
    picture_id_rewriter: SeqRewriter<PICTURE_ID_MAX>,
    tl0_rewriter: SeqRewriter<TL0_IDX_MAX>,
    sync_next: bool,
}

impl Vp8Context {
    pub fn new(params: EncodingContextParams) -> Self {
        Vp8Context {
            layers: LayerState::new(params),
            picture_id_rewriter: SeqRewriter::new(),
            tl0_rewriter: SeqRewriter::new(),
            sync_next: true,
        }
    }

    pub(crate) fn sync_required(&mut self) {
        self.sync_next = true;
    }

    pub(crate) fn process_payload(&mut self, payload: &mut [u8]) -> bool {
        let Some(desc) = parse(payload) else {
            // Not a parseable descriptor. No layer decision possible.
            return true;
        };

        // Re-base the rewritten counters so the first value after a switch
        // continues the outgoing series.
        if self.sync_next {
            if let Some(pid) = desc.picture_id {
                self.picture_id_rewriter.sync(pid as u64 + PICTURE_ID_MAX - 1);
            }
            if let Some(tl0) = desc.tl0_pic_idx {
                self.tl0_rewriter.sync(tl0 as u64 + TL0_IDX_MAX - 1);
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

            // Stepping up a temporal layer is only safe on a layer sync
            // frame. Until one comes along, keep dropping.
            if tid > current && !desc.layer_sync {
                self.drop_picture(&desc);
                return false;
            }

            if tid > current {
                trace!("VP8 current temporal layer up to {}", tid);
                self.layers.current = tid;
            } else if current > target {
                trace!("VP8 current temporal layer down to {}", target);
                self.layers.current = target;
            }
        }

        self.rewrite(payload, &desc);

        true
    }

    fn drop_picture(&mut self, desc: &Vp8Descriptor) {
        if let Some(pid) = desc.picture_id {
            self.picture_id_rewriter.drop(pid as u64);
        }
        // TL0PICIDX only increments on the base temporal layer, which is
        // never dropped.
    }

    fn rewrite(&mut self, payload: &mut [u8], desc: &Vp8Descriptor) {
        if let Some(pid) = desc.picture_id {
            let new_pid = self.picture_id_rewriter.input(pid as u64) as u16;

            if desc.picture_id_15bit {
                payload[desc.picture_id_offset] = 0x80 | (new_pid >> 8) as u8;
                payload[desc.picture_id_offset + 1] = (new_pid & 0xff) as u8;
            } else {
                payload[desc.picture_id_offset] = (new_pid & 0x7f) as u8;
            }
        }

        if let Some(tl0) = desc.tl0_pic_idx {
            payload[desc.tl0_pic_idx_offset] = self.tl0_rewriter.input(tl0 as u64) as u8;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Build a VP8 payload with a 15 bit picture id, tl0picidx and tid.
    fn vp8_payload(keyframe: bool, picture_id: u16, tl0: u8, tid: u8, layer_sync: bool) -> Vec<u8> {
        let header = if keyframe { 0x00 } else { 0x01 };
        let tidy = (tid << 6) | if layer_sync { 0x20 } else { 0x00 };
        vec![
            0x90, // X=1, S=1, PID=0
            0xe0, // I=1, L=1, T=1
            0x80 | (picture_id >> 8) as u8,
            (picture_id & 0xff) as u8,
            tl0,
            tidy,
            header,
            0xaa,
        ]
    }

    fn ctx() -> Vp8Context {
        let mut c = Vp8Context::new(EncodingContextParams {
            spatial_layers: 3,
            temporal_layers: 3,
        });
        c.layers.target = 2;
        c.layers.current = 0;
        c
    }

    #[test]
    fn parses_descriptor() {
        let payload = vp8_payload(true, 300, 7, 2, true);
        let desc = parse(&payload).unwrap();

        assert!(desc.start_of_frame);
        assert_eq!(desc.picture_id, Some(300));
        assert!(desc.picture_id_15bit);
        assert_eq!(desc.tl0_pic_idx, Some(7));
        assert_eq!(desc.tid, Some(2));
        assert!(desc.layer_sync);
    }

    #[test]
    fn keyframe_detection() {
        assert!(is_keyframe(&vp8_payload(true, 1, 0, 0, true)));
        assert!(!is_keyframe(&vp8_payload(false, 1, 0, 0, true)));

        // Continuation packets (S=0) never count as keyframes.
        let mut continuation = vp8_payload(true, 1, 0, 0, true);
        continuation[0] &= !0x10;
        assert!(!is_keyframe(&continuation));
    }

    #[test]
    fn drops_above_target_temporal_layer() {
        let mut c = ctx();
        c.layers.target = 0;

        let mut p0 = vp8_payload(false, 10, 1, 0, false);
        let mut p1 = vp8_payload(false, 11, 1, 1, true);

        assert!(c.process_payload(&mut p0));
        assert!(!c.process_payload(&mut p1));
    }

    #[test]
    fn upgrade_waits_for_layer_sync() {
        let mut c = ctx();

        // tid 1 without the sync bit cannot be stepped up to.
        let mut no_sync = vp8_payload(false, 10, 1, 1, false);
        assert!(!c.process_payload(&mut no_sync));
        assert_eq!(c.layers.current, 0);

        // With the sync bit, the layer upgrades.
        let mut sync = vp8_payload(false, 11, 1, 1, true);
        assert!(c.process_payload(&mut sync));
        assert_eq!(c.layers.current, 1);
    }

    #[test]
    fn downgrade_applies_on_next_forward() {
        let mut c = ctx();
        c.layers.current = 2;
        c.layers.target = 0;

        let mut p = vp8_payload(false, 10, 1, 0, false);
        assert!(c.process_payload(&mut p));
        assert_eq!(c.layers.current, 0);
    }

    #[test]
    fn picture_id_stays_contiguous_across_drops() {
        let mut c = ctx();
        c.layers.target = 0;

        let mut p0 = vp8_payload(false, 100, 1, 0, false);
        assert!(c.process_payload(&mut p0));
        let first = parse(&p0).unwrap().picture_id.unwrap();

        // A dropped tid 1 picture in between.
        let mut p1 = vp8_payload(false, 101, 1, 1, true);
        assert!(!c.process_payload(&mut p1));

        let mut p2 = vp8_payload(false, 102, 2, 0, false);
        assert!(c.process_payload(&mut p2));
        let second = parse(&p2).unwrap().picture_id.unwrap();

        assert_eq!(second, first + 1);
    }

    #[test]
    fn tl0_rewrite_continues_after_sync() {
        let mut c = ctx();

        let mut p0 = vp8_payload(false, 100, 10, 0, false);
        assert!(c.process_payload(&mut p0));
        let tl0_a = parse(&p0).unwrap().tl0_pic_idx.unwrap();

        // Stream switch. Counters re-base but stay contiguous.
        c.sync_required();
        let mut p1 = vp8_payload(true, 9000, 250, 0, false);
        assert!(c.process_payload(&mut p1));
        let tl0_b = parse(&p1).unwrap().tl0_pic_idx.unwrap();

        assert_eq!(tl0_b, tl0_a.wrapping_add(1));
    }

    #[test]
    fn no_temporal_info_forwards() {
        let mut c = ctx();

        // Descriptor with picture id only (no T bit).
        let mut p = vec![0x90, 0x80, 0x05, 0x00, 0xaa];
        assert!(c.process_payload(&mut p));
    }
}
