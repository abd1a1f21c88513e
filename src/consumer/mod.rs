//! The simulcast consumer: one outgoing RTP stream fed from whichever
//! producer encoding the layer selection currently points at.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::codec::{EncodingContext, EncodingContextParams};
use crate::rtp::{KeyFrameRequestKind, Nack, ReceiverReport, SdesChunk, SenderReport};
use crate::rtp::{Pt, RtpPacket, SeqRewriter, Ssrc};
use crate::streams::{ProducerRtpStream, SendStream, SendStreamParams};
use crate::util::ntp_ts_offset;
use crate::Error;

mod select;

/// RTCP interval for video, and the pacing slack factor applied to it.
const MAX_RTCP_VIDEO_INTERVAL_MS: u64 = 1000;
const MAX_RTCP_AUDIO_INTERVAL_MS: u64 = 5000;

/// Extra-offset packets allowed before the correction map is cleared.
const TS_EXTRA_OFFSET_APPLIED_MAX: u32 = 200;
const TS_EXTRA_OFFSET_PACKET_MAX: u32 = 500;

/// Media kind of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One `type`/`parameter` RTCP feedback entry of the negotiated codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

/// The negotiated media codec of the outgoing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTX parameters of the outgoing encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtxParams {
    pub ssrc: u32,
    pub payload_type: u8,
}

/// The single outgoing encoding of the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEncoding {
    pub ssrc: u32,
    pub spatial_layers: i16,
    pub temporal_layers: i16,
    #[serde(default)]
    pub rtx: Option<RtxParams>,
}

/// One consumable producer encoding: the mapped SSRC of spatial layer `i`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsumableEncoding {
    pub ssrc: u32,
}

/// Initial layer preference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredLayers {
    pub spatial_layer: i16,
    #[serde(default)]
    pub temporal_layer: Option<i16>,
}

/// Construction parameters for [`SimulcastConsumer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: String,
    pub kind: MediaKind,
    pub cname: String,
    pub codec: MediaCodec,
    pub encoding: OutputEncoding,
    pub consumable_encodings: Vec<ConsumableEncoding>,
    #[serde(default)]
    pub preferred_layers: Option<PreferredLayers>,
    /// When true, layer changes go through the external bitrate allocator
    /// (the provisional/commit entry points). When false, they apply
    /// immediately.
    #[serde(default)]
    pub externally_managed_bitrate: bool,
}

/// Control methods accepted by [`SimulcastConsumer::handle_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    RequestKeyFrame,
    SetPreferredLayers,
}

/// Spatial/temporal layer pair reported in `layerschange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: i16,
    pub temporal_layer: i16,
}

/// Notifications produced by the consumer, drained with
/// [`SimulcastConsumer::poll_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Our send stream score and the current producer stream score.
    Score { score: u8, producer_score: u8 },
    /// The forwarded layers changed. `None` means nothing is forwarded.
    LayersChange(Option<ConsumerLayers>),
}

impl ConsumerEvent {
    /// Event name on the notification channel.
    pub fn name(&self) -> &'static str {
        match self {
            ConsumerEvent::Score { .. } => "score",
            ConsumerEvent::LayersChange(_) => "layerschange",
        }
    }

    /// Event payload on the notification channel.
    pub fn data(&self) -> serde_json::Value {
        match self {
            ConsumerEvent::Score {
                score,
                producer_score,
            } => json!({
                "score": score,
                "producerScore": producer_score,
            }),
            ConsumerEvent::LayersChange(Some(layers)) => {
                serde_json::to_value(layers).expect("layers serialize")
            }
            ConsumerEvent::LayersChange(None) => serde_json::Value::Null,
        }
    }
}

/// Callbacks into the transport owning this consumer.
pub trait ConsumerListener {
    /// A rewritten packet ready to go on the wire.
    fn on_consumer_send_rtp_packet(&mut self, id: &str, packet: &RtpPacket);

    /// A recovered packet answering a NACK.
    fn on_consumer_retransmit_rtp_packet(&mut self, id: &str, packet: &RtpPacket);

    /// Ask the producer for a keyframe on the given mapped SSRC.
    fn on_consumer_key_frame_requested(&mut self, id: &str, mapped_ssrc: Ssrc);

    /// The consumer wants the bitrate allocator to run again.
    fn on_consumer_need_bitrate_change(&mut self, id: &str);
}

/// Forwards one of several producer simulcast encodings to a remote,
/// switching encodings seamlessly as stream health, bitrate budget and
/// preference dictate.
pub struct SimulcastConsumer {
    id: String,
    kind: MediaKind,

    paused: bool,
    producer_paused: bool,
    transport_connected: bool,

    /// Payload types this consumer can forward.
    supported_payload_types: Vec<Pt>,

    /// Mapped SSRC of each spatial layer, by layer index.
    consumable_ssrcs: Vec<Ssrc>,

    /// Reverse lookup of the above.
    map_mapped_ssrc_spatial_layer: HashMap<Ssrc, i16>,

    /// Producer stream handles by spatial layer. Slots fill in as the
    /// producer announces streams.
    producer_streams: Vec<Option<Rc<dyn ProducerRtpStream>>>,

    pub(crate) externally_managed_bitrate: bool,

    pub(crate) preferred_spatial_layer: i16,
    pub(crate) preferred_temporal_layer: i16,

    pub(crate) target_spatial_layer: i16,
    pub(crate) target_temporal_layer: i16,
    pub(crate) current_spatial_layer: i16,

    /// The first spatial layer ever targeted. Anchor for NTP based
    /// timestamp translation. Set once, never cleared.
    pub(crate) ts_reference_spatial_layer: i16,

    /// Scratch state between `use_available_bitrate` and `apply_layers`.
    pub(crate) provisional_target_spatial_layer: i16,
    pub(crate) provisional_target_temporal_layer: i16,

    /// The next forwarded packet must be a keyframe and re-anchor
    /// timestamps and sequence numbers.
    sync_required: bool,

    /// Subtracted from inbound RTP timestamps before emission.
    ts_offset: u32,

    /// Per-inbound-timestamp additive corrections, used when a post-switch
    /// keyframe would otherwise regress the outgoing timestamp.
    ts_extra_offsets: HashMap<u32, u32>,
    ts_extra_offset_packet_count: u32,

    encoding_context: EncodingContext,

    pub(crate) rtp_stream: SendStream,

    rtp_seq_manager: SeqRewriter,

    last_rtcp_sent_ms: u64,
    max_rtcp_interval_ms: u64,

    events: VecDeque<ConsumerEvent>,
}

impl fmt::Debug for SimulcastConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulcastConsumer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("paused", &self.paused)
            .field("producer_paused", &self.producer_paused)
            .field("transport_connected", &self.transport_connected)
            .field("supported_payload_types", &self.supported_payload_types)
            .field("consumable_ssrcs", &self.consumable_ssrcs)
            .field(
                "map_mapped_ssrc_spatial_layer",
                &self.map_mapped_ssrc_spatial_layer,
            )
            .field(
                "externally_managed_bitrate",
                &self.externally_managed_bitrate,
            )
            .field("preferred_spatial_layer", &self.preferred_spatial_layer)
            .field("preferred_temporal_layer", &self.preferred_temporal_layer)
            .field("target_spatial_layer", &self.target_spatial_layer)
            .field("target_temporal_layer", &self.target_temporal_layer)
            .field("current_spatial_layer", &self.current_spatial_layer)
            .field(
                "ts_reference_spatial_layer",
                &self.ts_reference_spatial_layer,
            )
            .field(
                "provisional_target_spatial_layer",
                &self.provisional_target_spatial_layer,
            )
            .field(
                "provisional_target_temporal_layer",
                &self.provisional_target_temporal_layer,
            )
            .field("sync_required", &self.sync_required)
            .field("ts_offset", &self.ts_offset)
            .field("ts_extra_offsets", &self.ts_extra_offsets)
            .field(
                "ts_extra_offset_packet_count",
                &self.ts_extra_offset_packet_count,
            )
            .field("encoding_context", &self.encoding_context)
            .field("rtp_stream", &self.rtp_stream)
            .field("rtp_seq_manager", &self.rtp_seq_manager)
            .field("last_rtcp_sent_ms", &self.last_rtcp_sent_ms)
            .field("max_rtcp_interval_ms", &self.max_rtcp_interval_ms)
            .field("events", &self.events)
            .finish()
    }
}

impl SimulcastConsumer {
    pub fn new(options: ConsumerOptions) -> Result<Self, Error> {
        // Simulcast means more than one encoding to choose from.
        if options.consumable_encodings.len() <= 1 {
            return Err(Error::InvalidEncodings(
                "fewer than 2 consumable encodings",
            ));
        }

        let encoding = &options.encoding;

        if encoding.spatial_layers as usize != options.consumable_encodings.len() {
            return Err(Error::InvalidEncodings(
                "spatial layers do not match number of consumable encodings",
            ));
        }

        let mut consumable_ssrcs = Vec::with_capacity(options.consumable_encodings.len());
        let mut map_mapped_ssrc_spatial_layer = HashMap::new();

        for (idx, consumable) in options.consumable_encodings.iter().enumerate() {
            let ssrc = Ssrc::from(consumable.ssrc);

            if map_mapped_ssrc_spatial_layer
                .insert(ssrc, idx as i16)
                .is_some()
            {
                return Err(Error::InvalidEncodings("duplicate mapped ssrc"));
            }

            consumable_ssrcs.push(ssrc);
        }

        let max_spatial = encoding.spatial_layers - 1;
        let max_temporal = encoding.temporal_layers - 1;

        let (preferred_spatial_layer, preferred_temporal_layer) = match options.preferred_layers {
            Some(preferred) => (
                preferred.spatial_layer.min(max_spatial),
                preferred.temporal_layer.unwrap_or(max_temporal).min(max_temporal),
            ),
            None => (max_spatial, max_temporal),
        };

        let encoding_context = EncodingContext::from_mime(
            &options.codec.mime_type,
            EncodingContextParams {
                spatial_layers: encoding.spatial_layers,
                temporal_layers: encoding.temporal_layers,
            },
        )?;

        let use_nack = has_feedback(&options.codec.rtcp_feedback, "nack", "");
        let use_pli = has_feedback(&options.codec.rtcp_feedback, "nack", "pli");
        let use_fir = has_feedback(&options.codec.rtcp_feedback, "ccm", "fir");

        let mut rtp_stream = SendStream::new(SendStreamParams {
            ssrc: encoding.ssrc.into(),
            payload_type: options.codec.payload_type.into(),
            clock_rate: options.codec.clock_rate,
            cname: options.cname.clone(),
            spatial_layers: encoding.spatial_layers,
            temporal_layers: encoding.temporal_layers,
            use_nack,
            use_pli,
            use_fir,
        });

        if let Some(rtx) = encoding.rtx {
            rtp_stream.set_rtx(rtx.payload_type.into(), rtx.ssrc.into());
        }

        let max_rtcp_interval_ms = match options.kind {
            MediaKind::Audio => MAX_RTCP_AUDIO_INTERVAL_MS,
            MediaKind::Video => MAX_RTCP_VIDEO_INTERVAL_MS,
        };

        let slots = options.consumable_encodings.len();

        Ok(SimulcastConsumer {
            id: options.id,
            kind: options.kind,
            paused: false,
            producer_paused: false,
            transport_connected: false,
            supported_payload_types: vec![options.codec.payload_type.into()],
            consumable_ssrcs,
            map_mapped_ssrc_spatial_layer,
            producer_streams: vec![None; slots],
            externally_managed_bitrate: options.externally_managed_bitrate,
            preferred_spatial_layer,
            preferred_temporal_layer,
            target_spatial_layer: -1,
            target_temporal_layer: -1,
            current_spatial_layer: -1,
            ts_reference_spatial_layer: -1,
            provisional_target_spatial_layer: -1,
            provisional_target_temporal_layer: -1,
            sync_required: false,
            ts_offset: 0,
            ts_extra_offsets: HashMap::new(),
            ts_extra_offset_packet_count: 0,
            encoding_context,
            rtp_stream,
            rtp_seq_manager: SeqRewriter::new(),
            last_rtcp_sent_ms: 0,
            max_rtcp_interval_ms,
            events: VecDeque::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether media can flow: transport up and neither side paused.
    pub fn is_active(&self) -> bool {
        self.transport_connected && !self.paused && !self.producer_paused
    }

    pub fn preferred_layers(&self) -> (i16, i16) {
        (self.preferred_spatial_layer, self.preferred_temporal_layer)
    }

    pub fn target_layers(&self) -> (i16, i16) {
        (self.target_spatial_layer, self.target_temporal_layer)
    }

    pub fn current_layers(&self) -> (i16, i16) {
        (
            self.current_spatial_layer,
            self.encoding_context.current_temporal_layer(),
        )
    }

    /// Next queued notification, if any.
    pub fn poll_event(&mut self) -> Option<ConsumerEvent> {
        self.events.pop_front()
    }

    // ---- Producer events ----------------------------------------------

    /// (Re)attach the producer stream handle for a mapped SSRC, without
    /// re-evaluating layers. Used when restoring existing state.
    pub fn producer_rtp_stream(&mut self, stream: Rc<dyn ProducerRtpStream>, mapped_ssrc: Ssrc) {
        let spatial_layer = *self
            .map_mapped_ssrc_spatial_layer
            .get(&mapped_ssrc)
            .expect("unknown mapped ssrc");

        self.producer_streams[spatial_layer as usize] = Some(stream);
    }

    /// A new producer stream appeared. Attach it and re-evaluate layers.
    pub fn producer_new_rtp_stream(
        &mut self,
        stream: Rc<dyn ProducerRtpStream>,
        mapped_ssrc: Ssrc,
        listener: &mut dyn ConsumerListener,
    ) {
        self.producer_rtp_stream(stream, mapped_ssrc);

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    /// A producer stream's score changed.
    pub fn producer_rtp_stream_score(
        &mut self,
        mapped_ssrc: Ssrc,
        score: u8,
        previous_score: u8,
        listener: &mut dyn ConsumerListener,
    ) {
        let spatial_layer = self.map_mapped_ssrc_spatial_layer.get(&mapped_ssrc).copied();

        // Emit the score event only if the stream whose score changed is
        // the current one.
        if spatial_layer == Some(self.current_spatial_layer) {
            self.emit_score();
        }

        if self.is_active() {
            // When the bitrate is externally managed, ongoing decisions
            // belong to the allocator. Only react when a stream dies or
            // comes back to life.
            if !self.externally_managed_bitrate || score == 0 || previous_score == 0 {
                self.may_change_layers(false, listener);
            }
        }
    }

    /// A producer stream got an RTCP sender report.
    pub fn producer_rtcp_sender_report(
        &mut self,
        _mapped_ssrc: Ssrc,
        first: bool,
        listener: &mut dyn ConsumerListener,
    ) {
        // Just interested in the first sender report of a stream.
        if !first {
            return;
        }

        // If our current stream has no SR yet, we cannot switch anywhere.
        let Some(current) = self.producer_current_rtp_stream() else {
            return;
        };
        if current.sender_report_ntp_ms() == 0 {
            return;
        }

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    // ---- Transport / pause lifecycle ----------------------------------

    pub fn transport_connected(&mut self, listener: &mut dyn ConsumerListener) {
        self.transport_connected = true;
        self.sync_required = true;

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    pub fn transport_disconnected(&mut self, listener: &mut dyn ConsumerListener) {
        self.transport_connected = false;

        self.rtp_stream.pause();
        self.update_target_layers(-1, -1, listener);
    }

    pub fn pause(&mut self, listener: &mut dyn ConsumerListener) {
        if self.paused {
            return;
        }
        self.paused = true;

        if self.transport_connected && !self.producer_paused {
            self.user_on_paused(listener);
        }
    }

    pub fn resume(&mut self, listener: &mut dyn ConsumerListener) {
        if !self.paused {
            return;
        }
        self.paused = false;

        if self.transport_connected && !self.producer_paused {
            self.user_on_resumed(listener);
        }
    }

    pub fn producer_pause(&mut self, listener: &mut dyn ConsumerListener) {
        if self.producer_paused {
            return;
        }
        self.producer_paused = true;

        if self.transport_connected && !self.paused {
            self.user_on_paused(listener);
        }
    }

    pub fn producer_resume(&mut self, listener: &mut dyn ConsumerListener) {
        if !self.producer_paused {
            return;
        }
        self.producer_paused = false;

        if self.transport_connected && !self.paused {
            self.user_on_resumed(listener);
        }
    }

    fn user_on_paused(&mut self, listener: &mut dyn ConsumerListener) {
        self.rtp_stream.pause();
        self.update_target_layers(-1, -1, listener);

        // Tell the transport so it can distribute the freed bitrate into
        // other consumers.
        if self.externally_managed_bitrate {
            listener.on_consumer_need_bitrate_change(&self.id);
        }
    }

    fn user_on_resumed(&mut self, listener: &mut dyn ConsumerListener) {
        self.sync_required = true;
        self.rtp_stream.resume();

        if self.is_active() {
            self.may_change_layers(false, listener);
        }
    }

    // ---- Control surface ----------------------------------------------

    /// Handle a control channel request.
    pub fn handle_request(
        &mut self,
        method: RequestMethod,
        data: &serde_json::Value,
        listener: &mut dyn ConsumerListener,
    ) -> Result<(), Error> {
        match method {
            RequestMethod::RequestKeyFrame => {
                if self.is_active() {
                    self.request_key_frames(listener);
                }
                Ok(())
            }
            RequestMethod::SetPreferredLayers => {
                let previous_preferred_spatial_layer = self.preferred_spatial_layer;
                let previous_preferred_temporal_layer = self.preferred_temporal_layer;

                let spatial_layer = data
                    .get("spatialLayer")
                    .and_then(|v| v.as_u64())
                    .ok_or(Error::BadRequest("missing spatialLayer"))?;

                self.preferred_spatial_layer =
                    (spatial_layer as i16).min(self.rtp_stream.spatial_layers() - 1);

                // temporalLayer is optional.
                self.preferred_temporal_layer =
                    match data.get("temporalLayer").and_then(|v| v.as_u64()) {
                        Some(temporal_layer) => {
                            (temporal_layer as i16).min(self.rtp_stream.temporal_layers() - 1)
                        }
                        None => self.rtp_stream.temporal_layers() - 1,
                    };

                debug!(
                    "preferred layers changed [spatial:{}, temporal:{}, consumerId:{}]",
                    self.preferred_spatial_layer, self.preferred_temporal_layer, self.id
                );

                if self.is_active()
                    && (self.preferred_spatial_layer != previous_preferred_spatial_layer
                        || self.preferred_temporal_layer != previous_preferred_temporal_layer)
                {
                    self.may_change_layers(true, listener);
                }

                Ok(())
            }
        }
    }

    // ---- Packet forwarding --------------------------------------------

    /// Entry point per inbound RTP packet from the producer.
    ///
    /// The packet is rewritten in place for sending and restored before
    /// returning, so the caller observes no side effect.
    pub fn send_rtp_packet(
        &mut self,
        packet: &mut RtpPacket,
        now_ms: u64,
        listener: &mut dyn ConsumerListener,
    ) {
        if !self.is_active() {
            return;
        }

        if self.target_temporal_layer == -1 {
            return;
        }

        // This may happen if this consumer supports just some codecs of
        // those in the corresponding producer.
        if !self.supported_payload_types.contains(&packet.payload_type) {
            trace!("payload type not supported [payloadType:{}]", packet.payload_type);
            return;
        }

        let Some(spatial_layer) = self
            .map_mapped_ssrc_spatial_layer
            .get(&packet.ssrc)
            .copied()
        else {
            debug_assert!(false, "packet with unknown mapped ssrc");
            return;
        };

        let is_keyframe = self.encoding_context.is_keyframe(&packet.payload);

        // Check whether this is the packet we are waiting for in order to
        // update the current spatial layer.
        if self.current_spatial_layer != self.target_spatial_layer
            && spatial_layer == self.target_spatial_layer
        {
            // Ignore if not a keyframe.
            if !is_keyframe {
                return;
            }

            debug!(
                "current spatial layer switching to {} [consumerId:{}]",
                self.target_spatial_layer, self.id
            );

            self.current_spatial_layer = self.target_spatial_layer;

            // Update target and current temporal layer.
            self.encoding_context
                .set_target_temporal_layer(self.target_temporal_layer);
            let packet_temporal_layer = self.encoding_context.temporal_layer(&packet.payload);
            self.encoding_context
                .set_current_temporal_layer(packet_temporal_layer);

            // The remote's loss reports refer to the stream we no longer
            // forward. Start from a clean score.
            self.rtp_stream.reset_score(10, false);

            self.emit_layers_change();
            self.emit_score();

            self.sync_required = true;
        }

        // If the packet belongs to a different spatial layer than the one
        // being sent, drop it.
        if spatial_layer != self.current_spatial_layer {
            return;
        }

        // If we need to sync and this is not a keyframe, ignore the packet.
        if self.sync_required && !is_keyframe {
            return;
        }

        // Whether this is the first packet after re-sync.
        let is_sync_packet = self.sync_required;

        if is_sync_packet {
            debug!("sync keyframe received [ssrc:{}]", packet.ssrc);

            // Sync our outgoing sequence numbers.
            self.rtp_seq_manager
                .sync(packet.sequence_number.wrapping_sub(1) as u64);

            // Sync our outgoing RTP timestamp.
            if spatial_layer == self.ts_reference_spatial_layer {
                self.ts_offset = 0;
            } else {
                // Not the stream we use as timestamp reference, so do NTP
                // based timestamp alignment. We only got here because both
                // the reference stream and this one have sender reports.
                let reference = self
                    .producer_ts_reference_rtp_stream()
                    .expect("no producer stream for the ts reference spatial layer")
                    .clone();
                let current = self
                    .producer_current_rtp_stream()
                    .expect("no producer stream for the current spatial layer")
                    .clone();

                assert!(
                    reference.sender_report_ntp_ms() != 0,
                    "no sender report for the ts reference stream"
                );
                assert!(
                    current.sender_report_ntp_ms() != 0,
                    "no sender report for the current stream"
                );

                self.ts_offset = ntp_ts_offset(
                    reference.sender_report_ntp_ms(),
                    reference.sender_report_ts(),
                    current.sender_report_ntp_ms(),
                    current.sender_report_ts(),
                    self.rtp_stream.clock_rate(),
                );
            }

            self.ts_extra_offsets.clear();
            self.ts_extra_offset_packet_count = 0;

            // When switching to a new stream it may happen that the
            // timestamp of this keyframe is lower than the last sent. If
            // so, apply an extra offset to fix it gradually.
            let ts_out = packet.timestamp.wrapping_sub(self.ts_offset);
            let max_ts = self.rtp_stream.max_packet_ts();

            if ts_out <= max_ts {
                let extra = max_ts
                    .wrapping_sub(packet.timestamp)
                    .wrapping_add(self.ts_offset)
                    .wrapping_add(1);

                self.ts_extra_offsets.insert(packet.timestamp, extra);

                warn!(
                    "ts extra offset needed [ts in:{}, ts out:{}, ts max out:{}, ts offset:{}]",
                    packet.timestamp, ts_out, max_ts, self.ts_offset
                );
            }

            self.encoding_context.sync_required();

            self.sync_required = false;
        }

        let previous_temporal_layer = self.encoding_context.current_temporal_layer();

        // The codec context may rewrite the payload descriptor in place.
        // Save the original fields so the packet can be restored on every
        // exit path from here on.
        packet.save();

        // Rewrite payload if needed. Drop the packet if necessary.
        if !self.encoding_context.process_payload(&mut packet.payload) {
            self.rtp_seq_manager.drop(packet.sequence_number as u64);
            packet.restore();
            return;
        }

        if previous_temporal_layer != self.encoding_context.current_temporal_layer() {
            self.emit_layers_change();
        }

        // Update RTP timestamp based on the NTP offset.
        let mut timestamp = packet.timestamp.wrapping_sub(self.ts_offset);

        if !self.ts_extra_offsets.is_empty() {
            let mut ts_extra_offset = 0u32;

            if let Some(&extra) = self.ts_extra_offsets.get(&packet.timestamp) {
                ts_extra_offset = extra;
            } else if timestamp < self.rtp_stream.max_packet_ts() {
                ts_extra_offset = self.rtp_stream.max_packet_ts() - timestamp + 1;
                self.ts_extra_offsets.insert(packet.timestamp, ts_extra_offset);

                trace!(
                    "ts extra offset generated [ts in:{}, ts out:{}, extra:{}]",
                    packet.timestamp,
                    timestamp,
                    ts_extra_offset
                );
            }

            timestamp = timestamp.wrapping_add(ts_extra_offset);

            // Reset if more than N packets.
            let applied_over = ts_extra_offset != 0 && {
                self.ts_extra_offset_packet_count += 1;
                self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_APPLIED_MAX
            };

            if applied_over || self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_PACKET_MAX {
                debug!("cleaning ts extra offset map");

                self.ts_extra_offsets.clear();
                self.ts_extra_offset_packet_count = 0;
            }
        }

        let seq = self.rtp_seq_manager.input(packet.sequence_number as u64) as u16;

        // Rewrite the packet.
        packet.ssrc = self.rtp_stream.ssrc();
        packet.sequence_number = seq;
        packet.timestamp = timestamp;

        if is_sync_packet {
            debug!(
                "sending sync packet [ssrc:{}, seq:{}, ts:{}]",
                packet.ssrc, packet.sequence_number, packet.timestamp
            );
        }

        if self.rtp_stream.receive_packet(packet, now_ms) {
            listener.on_consumer_send_rtp_packet(&self.id, packet);
        } else {
            warn!(
                "failed to send packet [ssrc:{}, seq:{}, ts:{}]",
                packet.ssrc, packet.sequence_number, packet.timestamp
            );
        }

        // Restore the original fields, header and payload both.
        packet.restore();
    }

    // ---- RTCP ---------------------------------------------------------

    /// Our contribution to the transport's RTCP compound packet, paced at
    /// the consumer's RTCP interval.
    pub fn get_rtcp(&mut self, now_ms: u64) -> Option<(SenderReport, SdesChunk)> {
        if ((now_ms - self.last_rtcp_sent_ms) as f32 * 1.15) < self.max_rtcp_interval_ms as f32 {
            return None;
        }

        let report = self.rtp_stream.rtcp_sender_report(now_ms)?;
        let sdes = self.rtp_stream.rtcp_sdes_chunk();

        self.last_rtcp_sent_ms = now_ms;

        Some((report, sdes))
    }

    /// Raise `worst` to our fraction lost if we are doing worse.
    pub fn need_worst_remote_fraction_lost(&self, worst: &mut u8) {
        if !self.is_active() {
            return;
        }

        let fraction_lost = self.rtp_stream.fraction_lost();

        if fraction_lost > *worst {
            *worst = fraction_lost;
        }
    }

    /// NACK feedback from the remote. Recovered packets go back out through
    /// the listener's retransmit callback.
    pub fn receive_nack(&mut self, nack: &Nack, listener: &mut dyn ConsumerListener) {
        if !self.is_active() {
            return;
        }

        for packet in self.rtp_stream.receive_nack(nack) {
            listener.on_consumer_retransmit_rtp_packet(&self.id, &packet);
        }
    }

    /// PLI/FIR from the remote.
    pub fn receive_key_frame_request(
        &mut self,
        kind: KeyFrameRequestKind,
        listener: &mut dyn ConsumerListener,
    ) {
        self.rtp_stream.receive_keyframe_request(kind);

        if self.is_active() {
            self.request_key_frame_for_current_spatial_layer(listener);
        }
    }

    /// Receiver report from the remote.
    pub fn receive_rtcp_receiver_report(
        &mut self,
        report: &ReceiverReport,
        now_ms: u64,
        listener: &mut dyn ConsumerListener,
    ) {
        let score_changed = self.rtp_stream.receive_rtcp_receiver_report(report, now_ms);

        if score_changed {
            self.emit_score();

            if self.is_active() && !self.externally_managed_bitrate {
                self.may_change_layers(false, listener);
            }
        }
    }

    /// Current sending bitrate in bps.
    pub fn get_transmission_rate(&mut self, now_ms: u64) -> u32 {
        if !self.is_active() {
            return 0;
        }

        self.rtp_stream.bitrate(now_ms)
    }

    pub fn get_rtt(&self) -> f32 {
        self.rtp_stream.rtt()
    }

    // ---- Keyframe requests --------------------------------------------

    /// Request keyframes for both the target and the current layer.
    pub fn request_key_frames(&mut self, listener: &mut dyn ConsumerListener) {
        if self.kind != MediaKind::Video {
            return;
        }

        let target = self.producer_target_rtp_stream().is_some();
        let current = self.producer_current_rtp_stream().is_some();

        if target {
            let mapped_ssrc = self.consumable_ssrcs[self.target_spatial_layer as usize];
            listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
        }

        if current && self.current_spatial_layer != self.target_spatial_layer {
            let mapped_ssrc = self.consumable_ssrcs[self.current_spatial_layer as usize];
            listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
        }
    }

    pub(crate) fn request_key_frame_for_target_spatial_layer(
        &mut self,
        listener: &mut dyn ConsumerListener,
    ) {
        if self.kind != MediaKind::Video {
            return;
        }

        if self.producer_target_rtp_stream().is_none() {
            return;
        }

        let mapped_ssrc = self.consumable_ssrcs[self.target_spatial_layer as usize];
        listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
    }

    fn request_key_frame_for_current_spatial_layer(&mut self, listener: &mut dyn ConsumerListener) {
        if self.kind != MediaKind::Video {
            return;
        }

        if self.producer_current_rtp_stream().is_none() {
            return;
        }

        let mapped_ssrc = self.consumable_ssrcs[self.current_spatial_layer as usize];
        listener.on_consumer_key_frame_requested(&self.id, mapped_ssrc);
    }

    // ---- Switch state machine -----------------------------------------

    pub(crate) fn update_target_layers(
        &mut self,
        new_target_spatial_layer: i16,
        new_target_temporal_layer: i16,
        listener: &mut dyn ConsumerListener,
    ) {
        // If we don't have a timestamp reference yet, set it now.
        if new_target_spatial_layer != -1 && self.ts_reference_spatial_layer == -1 {
            debug!(
                "using spatial layer {} as RTP timestamp reference [consumerId:{}]",
                new_target_spatial_layer, self.id
            );

            self.ts_reference_spatial_layer = new_target_spatial_layer;
        }

        if new_target_spatial_layer == -1 {
            // Unset current and target layers.
            self.target_spatial_layer = -1;
            self.target_temporal_layer = -1;
            self.current_spatial_layer = -1;

            self.encoding_context.set_target_temporal_layer(-1);
            self.encoding_context.set_current_temporal_layer(-1);

            debug!(
                "target layers changed [spatial:-1, temporal:-1, consumerId:{}]",
                self.id
            );

            self.emit_layers_change();

            return;
        }

        self.target_spatial_layer = new_target_spatial_layer;
        self.target_temporal_layer = new_target_temporal_layer;

        // If the new target spatial layer matches the current one, apply
        // the new target temporal layer now.
        if self.target_spatial_layer == self.current_spatial_layer {
            self.encoding_context
                .set_target_temporal_layer(self.target_temporal_layer);
        }

        debug!(
            "target layers changed [spatial:{}, temporal:{}, consumerId:{}]",
            self.target_spatial_layer, self.target_temporal_layer, self.id
        );

        // A different target spatial layer needs a keyframe to switch on.
        if self.target_spatial_layer != self.current_spatial_layer {
            self.request_key_frame_for_target_spatial_layer(listener);
        }
    }

    /// Whether we may target the given spatial layer: either it is the
    /// timestamp reference itself, or both it and the reference have sender
    /// reports enabling NTP timestamp translation.
    pub(crate) fn can_switch_to_spatial_layer(&self, spatial_layer: i16) -> bool {
        let stream = self.producer_streams[spatial_layer as usize]
            .as_ref()
            .expect("no producer stream for the given spatial layer");

        if self.ts_reference_spatial_layer == -1 {
            return true;
        }
        if spatial_layer == self.ts_reference_spatial_layer {
            return true;
        }

        let reference = self
            .producer_ts_reference_rtp_stream()
            .expect("no producer stream for the ts reference spatial layer");

        reference.sender_report_ntp_ms() != 0 && stream.sender_report_ntp_ms() != 0
    }

    // ---- Dump / stats -------------------------------------------------

    pub fn dump(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "kind": self.kind,
            "rtpStream": self.rtp_stream.fill_json(),
            "preferredSpatialLayer": self.preferred_spatial_layer,
            "targetSpatialLayer": self.target_spatial_layer,
            "currentSpatialLayer": self.current_spatial_layer,
            "preferredTemporalLayer": self.preferred_temporal_layer,
            "targetTemporalLayer": self.target_temporal_layer,
            "currentTemporalLayer": self.encoding_context.current_temporal_layer(),
        })
    }

    pub fn stats(&mut self, now_ms: u64) -> serde_json::Value {
        let mut array = vec![self.rtp_stream.fill_json_stats(now_ms)];

        if let Some(producer_stream) = self.producer_current_rtp_stream() {
            let stats = producer_stream.fill_json_stats(now_ms);
            if !stats.is_null() {
                array.push(stats);
            }
        }

        serde_json::Value::Array(array)
    }

    // ---- Internal helpers ---------------------------------------------

    pub(crate) fn producer_current_rtp_stream(&self) -> Option<&Rc<dyn ProducerRtpStream>> {
        self.producer_stream_at(self.current_spatial_layer)
    }

    pub(crate) fn producer_target_rtp_stream(&self) -> Option<&Rc<dyn ProducerRtpStream>> {
        self.producer_stream_at(self.target_spatial_layer)
    }

    pub(crate) fn producer_provisional_target_rtp_stream(
        &self,
    ) -> Option<&Rc<dyn ProducerRtpStream>> {
        self.producer_stream_at(self.provisional_target_spatial_layer)
    }

    pub(crate) fn producer_ts_reference_rtp_stream(&self) -> Option<&Rc<dyn ProducerRtpStream>> {
        self.producer_stream_at(self.ts_reference_spatial_layer)
    }

    pub(crate) fn producer_stream_at(
        &self,
        spatial_layer: i16,
    ) -> Option<&Rc<dyn ProducerRtpStream>> {
        if spatial_layer == -1 {
            return None;
        }

        self.producer_streams[spatial_layer as usize].as_ref()
    }

    pub(crate) fn producer_streams(&self) -> &[Option<Rc<dyn ProducerRtpStream>>] {
        &self.producer_streams
    }

    pub(crate) fn emit_score(&mut self) {
        let producer_score = self
            .producer_current_rtp_stream()
            .map(|s| s.score())
            .unwrap_or(0);

        self.events.push_back(ConsumerEvent::Score {
            score: self.rtp_stream.score(),
            producer_score,
        });
    }

    pub(crate) fn emit_layers_change(&mut self) {
        let layers = if self.current_spatial_layer >= 0 {
            Some(ConsumerLayers {
                spatial_layer: self.current_spatial_layer,
                temporal_layer: self.encoding_context.current_temporal_layer(),
            })
        } else {
            None
        };

        debug!(
            "current layers changed to {:?} [consumerId:{}]",
            layers, self.id
        );

        self.events.push_back(ConsumerEvent::LayersChange(layers));
    }
}

fn has_feedback(feedback: &[RtcpFeedback], kind: &str, parameter: &str) -> bool {
    feedback
        .iter()
        .any(|fb| fb.kind == kind && fb.parameter == parameter)
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullListener;

    impl ConsumerListener for NullListener {
        fn on_consumer_send_rtp_packet(&mut self, _id: &str, _packet: &RtpPacket) {}
        fn on_consumer_retransmit_rtp_packet(&mut self, _id: &str, _packet: &RtpPacket) {}
        fn on_consumer_key_frame_requested(&mut self, _id: &str, _mapped_ssrc: Ssrc) {}
        fn on_consumer_need_bitrate_change(&mut self, _id: &str) {}
    }

    fn options(consumable: usize, spatial_layers: i16) -> ConsumerOptions {
        ConsumerOptions {
            id: "c1".into(),
            kind: MediaKind::Video,
            cname: "cname".into(),
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
                ],
            },
            encoding: OutputEncoding {
                ssrc: 5000,
                spatial_layers,
                temporal_layers: 3,
                rtx: None,
            },
            consumable_encodings: (0..consumable)
                .map(|i| ConsumableEncoding {
                    ssrc: 1001 + i as u32,
                })
                .collect(),
            preferred_layers: None,
            externally_managed_bitrate: false,
        }
    }

    #[test]
    fn needs_at_least_two_encodings() {
        let err = SimulcastConsumer::new(options(1, 1)).unwrap_err();
        assert_eq!(err, Error::InvalidEncodings("fewer than 2 consumable encodings"));
    }

    #[test]
    fn spatial_layers_must_match_encodings() {
        let err = SimulcastConsumer::new(options(3, 2)).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidEncodings("spatial layers do not match number of consumable encodings")
        );
    }

    #[test]
    fn duplicate_mapped_ssrc_is_rejected() {
        let mut opts = options(3, 3);
        opts.consumable_encodings[2].ssrc = opts.consumable_encodings[0].ssrc;

        let err = SimulcastConsumer::new(opts).unwrap_err();
        assert_eq!(err, Error::InvalidEncodings("duplicate mapped ssrc"));
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let mut opts = options(3, 3);
        opts.codec.mime_type = "video/AV2".into();

        let err = SimulcastConsumer::new(opts).unwrap_err();
        assert_eq!(err, Error::UnsupportedCodec("video/AV2".into()));
    }

    #[test]
    fn preferred_layers_default_to_max() {
        let consumer = SimulcastConsumer::new(options(3, 3)).unwrap();
        assert_eq!(consumer.preferred_layers(), (2, 2));
    }

    #[test]
    fn preferred_layers_clamp_to_max() {
        let mut opts = options(3, 3);
        opts.preferred_layers = Some(PreferredLayers {
            spatial_layer: 9,
            temporal_layer: Some(7),
        });

        let consumer = SimulcastConsumer::new(opts).unwrap();
        assert_eq!(consumer.preferred_layers(), (2, 2));
    }

    #[test]
    fn set_preferred_layers_requires_spatial_layer() {
        let mut consumer = SimulcastConsumer::new(options(3, 3)).unwrap();
        let mut listener = NullListener;

        let err = consumer
            .handle_request(
                RequestMethod::SetPreferredLayers,
                &serde_json::json!({ "temporalLayer": 1 }),
                &mut listener,
            )
            .unwrap_err();

        assert_eq!(err, Error::BadRequest("missing spatialLayer"));
    }

    #[test]
    fn set_preferred_layers_clamps() {
        let mut consumer = SimulcastConsumer::new(options(3, 3)).unwrap();
        let mut listener = NullListener;

        consumer
            .handle_request(
                RequestMethod::SetPreferredLayers,
                &serde_json::json!({ "spatialLayer": 7, "temporalLayer": 9 }),
                &mut listener,
            )
            .unwrap();

        assert_eq!(consumer.preferred_layers(), (2, 2));
    }

    #[test]
    fn inactive_consumer_drops_everything() {
        let mut consumer = SimulcastConsumer::new(options(3, 3)).unwrap();
        let mut listener = NullListener;

        // Not connected: no layers, no forwarding.
        assert!(!consumer.is_active());

        let mut packet = RtpPacket::new(1001.into(), 96.into(), 1, 1000, vec![0x90, 0x00, 0x00]);
        consumer.send_rtp_packet(&mut packet, 0, &mut listener);

        assert_eq!(consumer.target_layers(), (-1, -1));
        assert!(consumer.poll_event().is_none());
    }

    #[test]
    fn event_json_shapes() {
        let score = ConsumerEvent::Score {
            score: 10,
            producer_score: 7,
        };
        assert_eq!(score.name(), "score");
        assert_eq!(score.data(), serde_json::json!({ "score": 10, "producerScore": 7 }));

        let change = ConsumerEvent::LayersChange(Some(ConsumerLayers {
            spatial_layer: 1,
            temporal_layer: 2,
        }));
        assert_eq!(change.name(), "layerschange");
        assert_eq!(
            change.data(),
            serde_json::json!({ "spatialLayer": 1, "temporalLayer": 2 })
        );

        let unset = ConsumerEvent::LayersChange(None);
        assert_eq!(unset.data(), serde_json::Value::Null);
    }

    #[test]
    fn dump_has_layer_fields() {
        let consumer = SimulcastConsumer::new(options(3, 3)).unwrap();
        let dump = consumer.dump();

        assert_eq!(dump["preferredSpatialLayer"], 2);
        assert_eq!(dump["targetSpatialLayer"], -1);
        assert_eq!(dump["currentSpatialLayer"], -1);
        assert_eq!(dump["currentTemporalLayer"], -1);
        assert_eq!(dump["rtpStream"]["ssrc"], 5000);
    }
}
