#![allow(unused)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Once;

use simulcast::rtp::{RtpPacket, Ssrc};
use simulcast::streams::ProducerRtpStream;
use simulcast::{
    ConsumableEncoding, ConsumerListener, ConsumerOptions, MediaCodec, MediaKind, OutputEncoding,
    RtcpFeedback, RtxParams, SimulcastConsumer,
};

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    });
}

/// Producer stream whose observable state tests can poke at will.
pub struct FakeProducerStream {
    pub ssrc: Ssrc,
    pub score: Cell<u8>,
    pub active_time: Cell<u64>,
    pub temporal_layers: i16,
    /// Cumulative bitrate up to and including temporal layer `i`.
    pub bitrates: Cell<[u32; 4]>,
    pub sr_ntp_ms: Cell<u64>,
    pub sr_ts: Cell<u32>,
    pub clock_rate: u32,
}

impl FakeProducerStream {
    pub fn new(ssrc: u32) -> Rc<Self> {
        Rc::new(FakeProducerStream {
            ssrc: ssrc.into(),
            score: Cell::new(10),
            active_time: Cell::new(10_000),
            temporal_layers: 3,
            bitrates: Cell::new([100_000, 180_000, 260_000, 0]),
            sr_ntp_ms: Cell::new(0),
            sr_ts: Cell::new(0),
            clock_rate: 90_000,
        })
    }

    pub fn with_sender_report(ssrc: u32, ntp_ms: u64, ts: u32) -> Rc<Self> {
        let stream = Self::new(ssrc);
        stream.sr_ntp_ms.set(ntp_ms);
        stream.sr_ts.set(ts);
        stream
    }
}

impl ProducerRtpStream for FakeProducerStream {
    fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    fn score(&self) -> u8 {
        self.score.get()
    }

    fn active_time(&self) -> u64 {
        self.active_time.get()
    }

    fn temporal_layers(&self) -> i16 {
        self.temporal_layers
    }

    fn bitrate(&self, _now_ms: u64, _spatial_layer: u8, temporal_layer: i16) -> u32 {
        self.bitrates.get()[temporal_layer as usize]
    }

    fn layer_bitrate(&self, now_ms: u64, spatial_layer: u8, temporal_layer: i16) -> u32 {
        let cumulative = self.bitrates.get();
        let below = if temporal_layer == 0 {
            0
        } else {
            cumulative[temporal_layer as usize - 1]
        };

        self.bitrate(now_ms, spatial_layer, temporal_layer)
            .saturating_sub(below)
    }

    fn sender_report_ntp_ms(&self) -> u64 {
        self.sr_ntp_ms.get()
    }

    fn sender_report_ts(&self) -> u32 {
        self.sr_ts.get()
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
}

/// Listener recording everything the consumer asks the transport to do.
#[derive(Default)]
pub struct RecordingListener {
    pub sent: Vec<RtpPacket>,
    pub retransmitted: Vec<RtpPacket>,
    pub keyframes_requested: Vec<Ssrc>,
    pub bitrate_changes_needed: usize,
}

impl ConsumerListener for RecordingListener {
    fn on_consumer_send_rtp_packet(&mut self, _id: &str, packet: &RtpPacket) {
        self.sent.push(packet.clone());
    }

    fn on_consumer_retransmit_rtp_packet(&mut self, _id: &str, packet: &RtpPacket) {
        self.retransmitted.push(packet.clone());
    }

    fn on_consumer_key_frame_requested(&mut self, _id: &str, mapped_ssrc: Ssrc) {
        self.keyframes_requested.push(mapped_ssrc);
    }

    fn on_consumer_need_bitrate_change(&mut self, _id: &str) {
        self.bitrate_changes_needed += 1;
    }
}

pub const MAPPED_SSRCS: [u32; 3] = [1001, 1002, 1003];
pub const OUTPUT_SSRC: u32 = 5000;

/// Three spatial layers of VP8, NACK/PLI feedback, RTX configured.
pub fn vp8_options(externally_managed_bitrate: bool) -> ConsumerOptions {
    ConsumerOptions {
        id: "consumer-1".into(),
        kind: MediaKind::Video,
        cname: "simulcast-test".into(),
        codec: MediaCodec {
            mime_type: "video/VP8".into(),
            payload_type: 96,
            clock_rate: 90_000,
            rtcp_feedback: vec![
                RtcpFeedback {
                    kind: "nack".into(),
                    parameter: "".into(),
                },
                RtcpFeedback {
                    kind: "nack".into(),
                    parameter: "pli".into(),
                },
                RtcpFeedback {
                    kind: "ccm".into(),
                    parameter: "fir".into(),
                },
            ],
        },
        encoding: OutputEncoding {
            ssrc: OUTPUT_SSRC,
            spatial_layers: 3,
            temporal_layers: 3,
            rtx: Some(RtxParams {
                ssrc: 5001,
                payload_type: 97,
            }),
        },
        consumable_encodings: MAPPED_SSRCS
            .iter()
            .map(|&ssrc| ConsumableEncoding { ssrc })
            .collect(),
        preferred_layers: None,
        externally_managed_bitrate,
    }
}

/// A VP8 packet with a full descriptor: 15 bit picture id, tl0picidx, tid.
pub fn vp8_packet(
    ssrc: u32,
    seq: u16,
    ts: u32,
    keyframe: bool,
    picture_id: u16,
    tl0: u8,
    tid: u8,
    layer_sync: bool,
) -> RtpPacket {
    let header = if keyframe { 0x00 } else { 0x01 };
    let tidy = (tid << 6) | if layer_sync { 0x20 } else { 0x00 };
    let payload = vec![
        0x90, // X=1, S=1, PID=0
        0xe0, // I=1, L=1, T=1
        0x80 | (picture_id >> 8) as u8,
        (picture_id & 0xff) as u8,
        tl0,
        tidy,
        header,
        0xaa,
        0xbb,
        0xcc,
    ];

    RtpPacket::new(ssrc.into(), 96.into(), seq, ts, payload)
}

/// Consumer with transport up and all three producer streams attached,
/// scored 10, with sender reports in place.
pub fn connected_consumer(
    externally_managed_bitrate: bool,
) -> (SimulcastConsumer, Vec<Rc<FakeProducerStream>>, RecordingListener) {
    let mut consumer = SimulcastConsumer::new(vp8_options(externally_managed_bitrate)).unwrap();
    let mut listener = RecordingListener::default();

    let streams: Vec<Rc<FakeProducerStream>> = MAPPED_SSRCS
        .iter()
        .enumerate()
        .map(|(i, &ssrc)| FakeProducerStream::with_sender_report(ssrc, 10_000, 90_000 * i as u32))
        .collect();

    for stream in &streams {
        consumer.producer_new_rtp_stream(stream.clone(), stream.ssrc(), &mut listener);
    }

    consumer.transport_connected(&mut listener);

    (consumer, streams, listener)
}
