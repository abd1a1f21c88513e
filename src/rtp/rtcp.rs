//! The RTCP data this engine consumes and produces.
//!
//! Only the value types are modeled. Compound packet assembly and the wire
//! codec live with the transport.

use super::Ssrc;

/// Which kind of keyframe request a remote peer sent us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameRequestKind {
    /// Picture Loss Indication.
    Pli,
    /// Full Intra Request.
    Fir,
}

/// Sender info produced for (and consumed from) RTCP sender reports.
///
/// The NTP/RTP timestamp pair is what enables cross-stream clock alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    /// The SSRC of the SR originator.
    pub ssrc: Ssrc,
    /// Seconds part of the 64 bit NTP timestamp.
    pub ntp_seconds: u32,
    /// Fraction part of the 64 bit NTP timestamp.
    pub ntp_fraction: u32,
    /// The RTP timestamp corresponding to the same point in time as the NTP
    /// timestamp above.
    pub rtp_timestamp: u32,
    /// Total number of packets sent when this report was generated.
    pub sender_packet_count: u32,
    /// Total number of payload octets sent when this report was generated.
    pub sender_octet_count: u32,
}

/// SDES CNAME chunk accompanying a sender report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: Ssrc,
    pub cname: String,
}

/// An individual report of reception, from the remote's receiver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: Ssrc,
    pub fraction_lost: u8,
    pub packets_lost: u32, // 24 bit
    pub max_seq: u32,
    pub jitter: u32,
    pub last_sr_time: u32,
    pub last_sr_delay: u32,
}

/// NACK feedback asking for retransmission of lost packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// SSRC the lost packets belong to.
    pub ssrc: Ssrc,
    /// Lost packet ranges.
    pub entries: Vec<NackEntry>,
}

/// One NACK pid/blp pair covering up to 17 sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl NackEntry {
    /// The lost sequence numbers this entry covers.
    pub fn into_iter(self) -> impl Iterator<Item = u16> {
        NackEntryIterator(self, 0)
    }
}

struct NackEntryIterator(NackEntry, u16);

impl Iterator for NackEntryIterator {
    type Item = u16;

    fn next(&mut self) -> Option<Self::Item> {
        let seq = if self.1 == 0 {
            self.1 += 1;
            self.0.pid
        } else {
            loop {
                if self.1 >= 17 {
                    return None;
                }
                let i = self.1 - 1;
                self.1 += 1;
                if 1 << i & self.0.blp > 0 {
                    break self.0.pid.wrapping_add(self.1 - 1);
                }
            }
        };
        Some(seq)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nack_entry_expands_pid_and_blp() {
        let entry = NackEntry {
            pid: 100,
            blp: 0b0000_0000_0000_0101,
        };

        let seqs: Vec<u16> = entry.into_iter().collect();
        assert_eq!(seqs, vec![100, 101, 103]);
    }

    #[test]
    fn nack_entry_wraps() {
        let entry = NackEntry {
            pid: 65_535,
            blp: 0b1,
        };

        let seqs: Vec<u16> = entry.into_iter().collect();
        assert_eq!(seqs, vec![65_535, 0]);
    }
}
