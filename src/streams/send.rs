use serde_json::json;

use crate::rtp::{KeyFrameRequestKind, Nack, ReceiverReport, RtpPacket, SdesChunk, SenderReport};
use crate::rtp::{Pt, Ssrc};
use crate::util::{calculate_rtt_ms, ms_to_ntp, ValueHistory};

use super::rtx_cache::RtxCache;

/// Sent packets are kept around this long to answer NACKs.
const RTX_CACHE_SIZE: usize = 600;
const RTX_CACHE_AGE_MS: u64 = 3000;

/// Configuration of the outgoing stream.
#[derive(Debug, Clone)]
pub struct SendStreamParams {
    /// The single SSRC this consumer uses on the wire.
    pub ssrc: Ssrc,

    /// Payload type of the media codec.
    pub payload_type: Pt,

    /// RTP clock rate of the media codec.
    pub clock_rate: u32,

    /// CNAME for our SDES chunk.
    pub cname: String,

    /// Spatial layers available across the producer encodings.
    pub spatial_layers: i16,

    /// Temporal layers per encoding.
    pub temporal_layers: i16,

    /// Whether the remote supports NACK.
    pub use_nack: bool,

    /// Whether the remote supports PLI.
    pub use_pli: bool,

    /// Whether the remote supports FIR.
    pub use_fir: bool,
}

/// The single outgoing encoded stream of a consumer.
///
/// Tracks what has been sent (for sender reports, NACK recovery and the
/// bitrate window) and what the remote reports back (fraction lost, RTT,
/// and the loss-driven score).
#[derive(Debug)]
pub struct SendStream {
    params: SendStreamParams,

    /// Resend (RTX) payload type and SSRC, if negotiated.
    rtx: Option<(Pt, Ssrc)>,

    /// Sequence counter for the RTX stream.
    seq_no_rtx: u16,

    /// Highest RTP timestamp sent, and the wallclock when it was sent.
    max_packet_ts: u32,
    max_packet_ms: u64,

    /// Health score 0-10 as seen by the remote, from receiver reports.
    score: u8,

    paused: bool,

    /// Loss reported by the remote in the last receiver report.
    fraction_lost: u8,
    packets_lost: u32,

    rtt: Option<f32>,

    /// Cache of sent packets for NACK recovery.
    rtx_cache: RtxCache,

    /// Bytes sent within the sliding bitrate window.
    transmitted: ValueHistory<u64>,

    stats: SendStreamStats,
}

/// Holder of counters.
#[derive(Debug, Default)]
struct SendStreamStats {
    packets: u64,
    bytes: u64,
    packets_resent: u64,
    bytes_resent: u64,
    nacks: u64,
    plis: u64,
    firs: u64,
}

impl SendStream {
    pub fn new(params: SendStreamParams) -> Self {
        // The RTX sequence series is unrelated to the media one and starts
        // at a random point, like any fresh RTP stream.
        let seq_no_rtx = rand::random::<u16>();

        debug!("create SendStream [ssrc:{}]", params.ssrc);

        let use_nack = params.use_nack;

        SendStream {
            params,
            rtx: None,
            seq_no_rtx,
            max_packet_ts: 0,
            max_packet_ms: 0,
            score: 0,
            paused: false,
            fraction_lost: 0,
            packets_lost: 0,
            rtt: None,
            rtx_cache: RtxCache::new(if use_nack { RTX_CACHE_SIZE } else { 0 }, RTX_CACHE_AGE_MS),
            transmitted: ValueHistory::default(),
            stats: SendStreamStats::default(),
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.params.ssrc
    }

    pub fn payload_type(&self) -> Pt {
        self.params.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.params.clock_rate
    }

    pub fn spatial_layers(&self) -> i16 {
        self.params.spatial_layers
    }

    pub fn temporal_layers(&self) -> i16 {
        self.params.temporal_layers
    }

    /// Declare the RTX payload type and SSRC used for resends.
    pub fn set_rtx(&mut self, payload_type: Pt, ssrc: Ssrc) {
        debug!("RTX enabled [ssrc:{}, pt:{}]", ssrc, payload_type);
        self.rtx = Some((payload_type, ssrc));
    }

    /// Account a rewritten packet about to go out on this stream.
    ///
    /// Returns false if the packet does not belong here, in which case it
    /// must not be handed to the transport.
    pub fn receive_packet(&mut self, packet: &RtpPacket, now_ms: u64) -> bool {
        if packet.ssrc != self.params.ssrc {
            warn!(
                "packet ssrc {} does not match stream ssrc {}",
                packet.ssrc, self.params.ssrc
            );
            return false;
        }

        let is_first = self.stats.packets == 0;

        if is_first || is_ts_higher(packet.timestamp, self.max_packet_ts) {
            self.max_packet_ts = packet.timestamp;
            self.max_packet_ms = now_ms;
        }

        self.stats.packets += 1;
        self.stats.bytes += packet.payload_len() as u64;

        self.transmitted.purge_old(now_ms);
        self.transmitted.push(now_ms, packet.payload_len() as u64);

        if self.params.use_nack {
            self.rtx_cache.cache_sent_packet(packet.clone(), now_ms);
        }

        true
    }

    /// Highest RTP timestamp sent so far.
    pub fn max_packet_ts(&self) -> u32 {
        self.max_packet_ts
    }

    /// Loss in percent derived from the last receiver report.
    pub fn loss_percentage(&self) -> u8 {
        (self.fraction_lost as u32 * 100 / 256) as u8
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    /// Overwrite the score, e.g. when a layer switch makes the remote's old
    /// loss reports meaningless. Returns whether a notification is wanted.
    pub fn reset_score(&mut self, score: u8, notify: bool) -> bool {
        let changed = self.score != score;
        self.score = score;

        notify && changed
    }

    /// Stop sending. Clears the resend cache; old packets are not worth
    /// retransmitting when we come back.
    pub fn pause(&mut self) {
        self.paused = true;
        self.rtx_cache.clear();
        self.score = 0;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Produce our RTCP sender report, if anything has been sent.
    pub fn rtcp_sender_report(&self, now_ms: u64) -> Option<SenderReport> {
        if self.stats.packets == 0 {
            return None;
        }

        let (ntp_seconds, ntp_fraction) = ms_to_ntp(now_ms);

        // Project the RTP timestamp forward from the last sent packet.
        let diff_ms = now_ms.saturating_sub(self.max_packet_ms);
        let diff_ts = (diff_ms * self.params.clock_rate as u64 / 1000) as u32;

        Some(SenderReport {
            ssrc: self.params.ssrc,
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp: self.max_packet_ts.wrapping_add(diff_ts),
            sender_packet_count: self.stats.packets as u32,
            sender_octet_count: self.stats.bytes as u32,
        })
    }

    /// Our SDES CNAME chunk.
    pub fn rtcp_sdes_chunk(&self) -> SdesChunk {
        SdesChunk {
            ssrc: self.params.ssrc,
            cname: self.params.cname.clone(),
        }
    }

    /// Handle NACK feedback. Returns the recovered packets, rewritten for
    /// the RTX stream, ready to hand back to the transport.
    pub fn receive_nack(&mut self, nack: &Nack) -> Vec<RtpPacket> {
        self.stats.nacks += 1;

        let mut resends = Vec::new();

        // We do not handle resends unless the RTX mechanic is set up.
        let Some((rtx_pt, rtx_ssrc)) = self.rtx else {
            return resends;
        };

        for entry in &nack.entries {
            for seq in entry.into_iter() {
                // The seq could simply be too old to exist in the cache, in
                // which case we will not do a resend.
                let Some(packet) = self.rtx_cache.get(seq) else {
                    trace!("no cached packet for NACKed seq {}", seq);
                    continue;
                };

                let mut resend = packet.clone();
                resend.ssrc = rtx_ssrc;
                resend.payload_type = rtx_pt;
                resend.sequence_number = self.seq_no_rtx;
                self.seq_no_rtx = self.seq_no_rtx.wrapping_add(1);

                self.stats.packets_resent += 1;
                self.stats.bytes_resent += resend.payload_len() as u64;

                resends.push(resend);
            }
        }

        resends
    }

    /// Count an incoming PLI or FIR.
    pub fn receive_keyframe_request(&mut self, kind: KeyFrameRequestKind) {
        match kind {
            KeyFrameRequestKind::Pli => self.stats.plis += 1,
            KeyFrameRequestKind::Fir => self.stats.firs += 1,
        }
    }

    /// Ingest the remote's receiver report. Returns whether the score
    /// changed.
    pub fn receive_rtcp_receiver_report(&mut self, report: &ReceiverReport, now_ms: u64) -> bool {
        self.fraction_lost = report.fraction_lost;
        self.packets_lost = report.packets_lost;

        // Keep the previous RTT when the report carries no LSR.
        if let Some(rtt) = calculate_rtt_ms(now_ms, report.last_sr_delay, report.last_sr_time) {
            self.rtt = Some(rtt);
        }

        // Score follows the remote's reported loss: no loss is a 10, total
        // loss a 0.
        let new_score = 10u8.saturating_sub((self.loss_percentage() as f32 / 10.0).round() as u8);

        let changed = new_score != self.score;
        self.score = new_score;

        changed
    }

    /// Sending bitrate in bps over the sliding window.
    pub fn bitrate(&mut self, now_ms: u64) -> u32 {
        self.transmitted.purge_old(now_ms);

        (self.transmitted.sum() * 8) as u32
    }

    pub fn rtt(&self) -> f32 {
        self.rtt.unwrap_or(0.0)
    }

    /// Dump of the stream setup, part of the consumer dump JSON.
    pub fn fill_json(&self) -> serde_json::Value {
        json!({
            "ssrc": *self.params.ssrc,
            "payloadType": *self.params.payload_type,
            "clockRate": self.params.clock_rate,
            "cname": self.params.cname,
            "spatialLayers": self.params.spatial_layers,
            "temporalLayers": self.params.temporal_layers,
            "rtxSsrc": self.rtx.map(|(_, ssrc)| *ssrc),
            "paused": self.paused,
        })
    }

    /// Stats of the stream, entry 0 of the consumer stats array.
    pub fn fill_json_stats(&mut self, now_ms: u64) -> serde_json::Value {
        json!({
            "type": "outbound-rtp",
            "timestamp": now_ms,
            "ssrc": *self.params.ssrc,
            "kind": "video",
            "score": self.score,
            "packetCount": self.stats.packets,
            "byteCount": self.stats.bytes,
            "packetsRetransmitted": self.stats.packets_resent,
            "packetsLost": self.packets_lost,
            "fractionLost": self.fraction_lost,
            "nackCount": self.stats.nacks,
            "pliCount": self.stats.plis,
            "firCount": self.stats.firs,
            "bitrate": self.bitrate(now_ms),
            "roundTripTime": self.rtt,
        })
    }
}

/// RTP timestamp order comparison, tolerating wrap.
fn is_ts_higher(lhs: u32, rhs: u32) -> bool {
    lhs != rhs && lhs.wrapping_sub(rhs) < u32::MAX / 2
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> SendStreamParams {
        SendStreamParams {
            ssrc: 9000.into(),
            payload_type: 96.into(),
            clock_rate: 90_000,
            cname: "test".into(),
            spatial_layers: 3,
            temporal_layers: 3,
            use_nack: true,
            use_pli: true,
            use_fir: false,
        }
    }

    fn packet(seq: u16, ts: u32) -> RtpPacket {
        RtpPacket::new(9000.into(), 96.into(), seq, ts, vec![0; 100])
    }

    #[test]
    fn tracks_max_packet_ts() {
        let mut s = SendStream::new(params());

        assert!(s.receive_packet(&packet(1, 3000), 10));
        assert!(s.receive_packet(&packet(2, 6000), 20));
        // Reordered packet does not move the max back.
        assert!(s.receive_packet(&packet(3, 4500), 30));

        assert_eq!(s.max_packet_ts(), 6000);
    }

    #[test]
    fn rejects_foreign_ssrc() {
        let mut s = SendStream::new(params());
        let mut p = packet(1, 3000);
        p.ssrc = 1234.into();

        assert!(!s.receive_packet(&p, 10));
    }

    #[test]
    fn no_sender_report_before_first_packet() {
        let s = SendStream::new(params());
        assert!(s.rtcp_sender_report(1000).is_none());
    }

    #[test]
    fn sender_report_projects_rtp_time() {
        let mut s = SendStream::new(params());
        s.receive_packet(&packet(1, 90_000), 1000);

        let sr = s.rtcp_sender_report(2000).unwrap();

        // One second at 90kHz.
        assert_eq!(sr.rtp_timestamp, 90_000 + 90_000);
        assert_eq!(sr.sender_packet_count, 1);
        assert_eq!(sr.sender_octet_count, 100);
    }

    #[test]
    fn nack_recovers_cached_packets_via_rtx() {
        let mut s = SendStream::new(params());
        s.set_rtx(97.into(), 9001.into());

        s.receive_packet(&packet(10, 3000), 0);
        s.receive_packet(&packet(11, 3000), 0);

        let nack = Nack {
            ssrc: 9000.into(),
            entries: vec![crate::rtp::NackEntry { pid: 10, blp: 0b1 }],
        };

        let resends = s.receive_nack(&nack);
        assert_eq!(resends.len(), 2);
        assert!(resends.iter().all(|p| p.ssrc == 9001.into()));
        assert!(resends.iter().all(|p| p.payload_type == 97.into()));
        // RTX seq numbers are consecutive.
        let diff = resends[1]
            .sequence_number
            .wrapping_sub(resends[0].sequence_number);
        assert_eq!(diff, 1);
    }

    #[test]
    fn nack_without_rtx_recovers_nothing() {
        let mut s = SendStream::new(params());
        s.receive_packet(&packet(10, 3000), 0);

        let nack = Nack {
            ssrc: 9000.into(),
            entries: vec![crate::rtp::NackEntry { pid: 10, blp: 0 }],
        };

        assert!(s.receive_nack(&nack).is_empty());
    }

    #[test]
    fn score_follows_reported_loss() {
        let mut s = SendStream::new(params());

        let mut report = ReceiverReport {
            ssrc: 9000.into(),
            fraction_lost: 0,
            packets_lost: 0,
            max_seq: 0,
            jitter: 0,
            last_sr_time: 0,
            last_sr_delay: 0,
        };

        assert!(s.receive_rtcp_receiver_report(&report, 1000));
        assert_eq!(s.score(), 10);

        report.fraction_lost = 128; // 50%
        assert!(s.receive_rtcp_receiver_report(&report, 2000));
        assert_eq!(s.score(), 5);
    }

    #[test]
    fn reset_score_notify_semantics() {
        let mut s = SendStream::new(params());

        // Changed but notify false.
        assert!(!s.reset_score(10, false));
        // Unchanged with notify true.
        assert!(!s.reset_score(10, true));
        // Changed with notify true.
        assert!(s.reset_score(3, true));
    }

    #[test]
    fn bitrate_uses_sliding_window() {
        let mut s = SendStream::new(params());

        s.receive_packet(&packet(1, 0), 0);
        s.receive_packet(&packet(2, 0), 500);

        // Both packets inside the window: 200 bytes.
        assert_eq!(s.bitrate(900), 1600);
        // First packet aged out.
        assert_eq!(s.bitrate(1400), 800);
    }
}
