use crate::rtp::Ssrc;

/// Read-only view of a producer-side RTP stream, one per simulcast encoding.
///
/// The consumer never owns these. They are shared handles into producer
/// state, observed through getters only; the producer updates the slots via
/// [`SimulcastConsumer::producer_rtp_stream`].
///
/// [`SimulcastConsumer::producer_rtp_stream`]: crate::SimulcastConsumer::producer_rtp_stream
pub trait ProducerRtpStream {
    /// The mapped SSRC of this encoding.
    fn ssrc(&self) -> Ssrc;

    /// Health score, 0-10. 0 means the stream is dead.
    fn score(&self) -> u8;

    /// Milliseconds this stream has been continuously emitting media.
    fn active_time(&self) -> u64;

    /// Number of temporal layers in this encoding.
    fn temporal_layers(&self) -> i16;

    /// Bitrate in bps of the encoding up to and including the given
    /// temporal layer.
    fn bitrate(&self, now_ms: u64, spatial_layer: u8, temporal_layer: i16) -> u32;

    /// Bitrate in bps contributed by the given temporal layer alone.
    fn layer_bitrate(&self, now_ms: u64, spatial_layer: u8, temporal_layer: i16) -> u32;

    /// NTP timestamp (ms) of the last RTCP sender report, 0 if none seen.
    fn sender_report_ntp_ms(&self) -> u64;

    /// RTP timestamp of the last RTCP sender report.
    fn sender_report_ts(&self) -> u32;

    /// RTP clock rate of this encoding.
    fn clock_rate(&self) -> u32;

    /// Stats JSON for this stream, used in the consumer stats array.
    fn fill_json_stats(&self, now_ms: u64) -> serde_json::Value {
        let _ = now_ms;
        serde_json::Value::Null
    }
}
