//! Sender-side congestion controller: slow start / congestion avoidance /
//! recovery, bytes-in-flight tracking, and reordering-threshold loss
//! detection (spec.md §4.4).
//!
//! Grounded on `quinn-proto::Connection`'s congestion-control fields and
//! `on_ack_received`/`on_packet_acked`/`detect_lost_packets`/`in_recovery`
//! methods — the slow-start/congestion-avoidance growth arithmetic is
//! lifted near-verbatim and simplified to spec.md's reordering-only loss
//! rule (no time-based loss detection, no TLP/RTO alarms: §5 rules out
//! internal timers).

use std::collections::BTreeMap;

use crate::packet::Packet;
use crate::Config;

pub const MAX_DATAGRAM: u64 = 1200;
pub const INITIAL_CWND: u64 = 10 * MAX_DATAGRAM;
pub const MIN_CWND: u64 = 2 * MAX_DATAGRAM;

/// A sent packet awaiting acknowledgement or loss declaration (spec.md §3).
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub in_flight: bool,
    pub ack_eliciting: bool,
    pub sent_bytes: u64,
    pub time_sent: u64,
    pub packet_ref: Packet,
}

/// The RFC-9002-style sender-side congestion controller.
pub struct CongestionController {
    pub congestion_window: u64,
    pub bytes_in_flight: u64,
    pub slow_start_threshold: u64,
    pub sent_packets: BTreeMap<u32, SentPacket>,
    recovery_start_time: Option<u64>,
    time_of_last_loss_sent: Option<u64>,
    default_mss: u64,
    minimum_window: u64,
    reordering_threshold: u32,
    log: slog::Logger,
}

impl CongestionController {
    pub fn new(log: slog::Logger) -> Self {
        Self::with_config(log, &Config::default())
    }

    pub fn with_config(log: slog::Logger, config: &Config) -> Self {
        CongestionController {
            congestion_window: config.initial_window,
            bytes_in_flight: 0,
            slow_start_threshold: u64::MAX,
            sent_packets: BTreeMap::new(),
            recovery_start_time: None,
            time_of_last_loss_sent: None,
            default_mss: config.default_mss,
            minimum_window: config.minimum_window,
            reordering_threshold: config.reordering_threshold,
            log,
        }
    }

    pub fn can_send(&self) -> bool {
        self.bytes_in_flight < self.congestion_window
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    /// Records an ack-eliciting packet as sent and gated on cwnd. Caller
    /// must have already checked `can_send()` and written the packet to
    /// the wire.
    pub fn send_cc(&mut self, packet_number: u32, packet: Packet, sent_bytes: u64, now: u64) {
        trace!(self.log, "sending ack-eliciting packet"; "pn" => packet_number, "bytes" => sent_bytes);
        self.bytes_in_flight += sent_bytes;
        self.sent_packets.insert(
            packet_number,
            SentPacket {
                in_flight: true,
                ack_eliciting: true,
                sent_bytes,
                time_sent: now,
                packet_ref: packet,
            },
        );
    }

    /// Records a non-ack-eliciting packet (ACK/PADDING/CLOSE) as sent.
    /// Does not gate on cwnd and does not contribute to bytes-in-flight.
    pub fn send_non_eliciting(&mut self, packet_number: u32, packet: Packet, now: u64) {
        self.sent_packets.insert(
            packet_number,
            SentPacket {
                in_flight: false,
                ack_eliciting: false,
                sent_bytes: 0,
                time_sent: now,
                packet_ref: packet,
            },
        );
    }

    /// Processes an ACK naming `acked_pns`. Returns the records that were
    /// popped (ack-eliciting or not) so the controller can also purge the
    /// received-pn set of acks-of-acks (§9 Open Question 4).
    pub fn on_ack(&mut self, acked_pns: &[u32], now: u64) -> Vec<(u32, SentPacket)> {
        let mut popped = Vec::new();
        for &pn in acked_pns {
            let Some(info) = self.sent_packets.remove(&pn) else {
                continue;
            };
            if !info.in_flight {
                popped.push((pn, info));
                continue;
            }
            self.bytes_in_flight -= info.sent_bytes;
            let still_in_recovery = self
                .recovery_start_time
                .map(|t| info.time_sent <= t)
                .unwrap_or(false);
            if !still_in_recovery {
                if self.in_slow_start() {
                    self.congestion_window += info.sent_bytes;
                } else {
                    self.congestion_window +=
                        self.default_mss * info.sent_bytes / self.congestion_window;
                }
                self.recovery_start_time = None;
                self.time_of_last_loss_sent = None;
            }
            popped.push((pn, info));
        }
        trace!(self.log, "processed ack"; "cwnd" => self.congestion_window, "bytes_in_flight" => self.bytes_in_flight);
        let _ = now;
        popped
    }

    /// Declares packets lost by the reordering-threshold rule (spec.md
    /// §4.4/§8 invariant 8): ack-eliciting, in-flight, pn < largest_acked,
    /// and largest_acked - pn >= REORDERING_THRESHOLD.
    pub fn detect_and_handle_loss(&mut self, largest_acked: u32, now: u64) -> Vec<(u32, SentPacket)> {
        let threshold = self.reordering_threshold;
        let lost_pns: Vec<u32> = self
            .sent_packets
            .iter()
            .filter(|(&pn, info)| {
                info.ack_eliciting
                    && info.in_flight
                    && pn < largest_acked
                    && largest_acked - pn >= threshold
            })
            .map(|(&pn, _)| pn)
            .collect();

        let mut lost = Vec::new();
        for pn in lost_pns {
            let info = self.sent_packets.remove(&pn).unwrap();
            self.bytes_in_flight -= info.sent_bytes;
            self.time_of_last_loss_sent = Some(
                self.time_of_last_loss_sent
                    .map(|t| t.max(info.time_sent))
                    .unwrap_or(info.time_sent),
            );
            debug!(self.log, "declared packet lost"; "pn" => pn, "largest_acked" => largest_acked);
            lost.push((pn, info));
        }

        if !lost.is_empty() {
            let currently_in_recovery = self
                .recovery_start_time
                .zip(self.time_of_last_loss_sent)
                .map(|(r, l)| l <= r)
                .unwrap_or(false);
            if !currently_in_recovery {
                self.slow_start_threshold = self.congestion_window / 2;
                self.congestion_window = self.slow_start_threshold.max(self.minimum_window);
                self.recovery_start_time = Some(now);
                debug!(self.log, "entering recovery"; "cwnd" => self.congestion_window, "ssthresh" => self.slow_start_threshold);
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Header, LongType};
    use crate::ConnectionId;

    fn dummy_packet() -> Packet {
        Packet::new(
            Header::Long {
                ty: LongType::Initial,
                version: crate::VERSION,
                dst_cid: ConnectionId(1),
                src_cid: ConnectionId(2),
                packet_number: 0,
            },
            vec![],
        )
    }

    fn log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn s5_loss_and_retransmission() {
        let mut cc = CongestionController::new(log());
        for pn in 0..=6u32 {
            cc.send_cc(pn, dummy_packet(), 100, 0);
        }
        assert_eq!(cc.bytes_in_flight, 700);

        // ACK: largest_acked=6, first_range=3 (acked {3,4,5,6}), plus a
        // range covering {0,1}.
        let acked = vec![0, 1, 3, 4, 5, 6];
        cc.on_ack(&acked, 10);
        assert_eq!(cc.bytes_in_flight, 100); // only pn=2 remains in flight

        let lost = cc.detect_and_handle_loss(6, 10);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, 2);
        assert_eq!(cc.bytes_in_flight, 0);
    }

    #[test]
    fn admission_gates_on_cwnd() {
        let mut cc = CongestionController::new(log());
        assert!(cc.can_send());
        cc.send_cc(0, dummy_packet(), INITIAL_CWND, 0);
        assert!(!cc.can_send());
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = CongestionController::new(log());
        let before = cc.congestion_window;
        cc.send_cc(0, dummy_packet(), 500, 0);
        cc.on_ack(&[0], 1);
        assert_eq!(cc.congestion_window, before + 500);
    }

    #[test]
    fn loss_halves_cwnd_once_per_epoch() {
        let mut cc = CongestionController::new(log());
        for pn in 0..10u32 {
            cc.send_cc(pn, dummy_packet(), 100, 0);
        }
        let before = cc.congestion_window;
        let lost1 = cc.detect_and_handle_loss(9, 5);
        assert!(!lost1.is_empty());
        assert_eq!(cc.congestion_window, (before / 2).max(MIN_CWND));

        // More packets sent *before* recovery started (t=3 <= recovery
        // start of 5) are later declared lost too: still the same epoch,
        // so cwnd must not halve a second time.
        let cwnd_after_first = cc.congestion_window;
        for pn in 10..13u32 {
            cc.send_cc(pn, dummy_packet(), 100, 3);
        }
        let lost2 = cc.detect_and_handle_loss(15, 7);
        assert!(!lost2.is_empty());
        assert_eq!(cc.congestion_window, cwnd_after_first);
    }

    #[test]
    fn non_eliciting_packets_never_count_toward_bytes_in_flight() {
        let mut cc = CongestionController::new(log());
        cc.send_non_eliciting(0, dummy_packet(), 0);
        assert_eq!(cc.bytes_in_flight, 0);
        let popped = cc.on_ack(&[0], 1);
        assert_eq!(popped.len(), 1);
        assert_eq!(cc.bytes_in_flight, 0);
    }
}
