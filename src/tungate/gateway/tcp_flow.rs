//! Per-flow TCP state machine. Tracks just enough RFC 793 state to translate between the raw
//! segments seen on the TUN device and a plain bidirectional byte stream to the proxy socket:
//! sequence/ack bookkeeping, half-close tracking, and an idle deadline.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlowState {
    SynRcvd,
    Established,
    CloseWait,
    FinWait,
    LastAck,
    TimeWait,
    Closed,
}

impl std::fmt::Display for TcpFlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TcpFlowState::SynRcvd => "syn_rcvd",
            TcpFlowState::Established => "established",
            TcpFlowState::CloseWait => "close_wait",
            TcpFlowState::FinWait => "fin_wait",
            TcpFlowState::LastAck => "last_ack",
            TcpFlowState::TimeWait => "time_wait",
            TcpFlowState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

pub const TIME_WAIT_DURATION: Duration = Duration::from_secs(30);

pub struct TcpFlow {
    pub state: TcpFlowState,
    /// Initial sequence number the client chose (from its SYN).
    pub client_isn: u32,
    /// Initial sequence number we chose for our synthesized SYN-ACK.
    pub server_isn: u32,
    /// Next sequence number we expect from the client.
    pub client_next_seq: u32,
    /// Next sequence number we will send (our side's byte stream position).
    pub server_next_seq: u32,
    pub client_window: u16,
    pub last_activity: Instant,
    pub entered_time_wait_at: Option<Instant>,
}

impl TcpFlow {
    /// Begins a flow after seeing a client SYN, choosing our own ISN from a process-wide CSPRNG
    /// so sequence numbers aren't predictable across connections.
    pub fn new(client_isn: u32, client_window: u16) -> Self {
        let server_isn: u32 = rand::rng().random();
        TcpFlow {
            state: TcpFlowState::SynRcvd,
            client_isn,
            server_isn,
            client_next_seq: client_isn.wrapping_add(1),
            server_next_seq: server_isn.wrapping_add(1),
            client_window,
            last_activity: Instant::now(),
            entered_time_wait_at: None,
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        TcpFlow::new(0, 65535)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Client ACKed our SYN-ACK: SYN_RCVD -> ESTABLISHED.
    pub fn on_established(&mut self) {
        if self.state == TcpFlowState::SynRcvd {
            self.state = TcpFlowState::Established;
            self.touch();
        }
    }

    /// We observed data flowing in either direction while established; keeps the flow alive.
    pub fn on_data(&mut self, client_bytes: u32) {
        self.client_next_seq = self.client_next_seq.wrapping_add(client_bytes);
        self.touch();
    }

    pub fn on_server_bytes_sent(&mut self, n: u32) {
        self.server_next_seq = self.server_next_seq.wrapping_add(n);
    }

    /// Client sent FIN: the proxy-facing half is done reading from the client. We keep writing
    /// data the remote peer still has queued (half-close), matching a real TCP CLOSE_WAIT.
    pub fn on_client_fin(&mut self) {
        self.client_next_seq = self.client_next_seq.wrapping_add(1);
        self.state = match self.state {
            TcpFlowState::Established => TcpFlowState::CloseWait,
            TcpFlowState::FinWait => TcpFlowState::TimeWait,
            other => other,
        };
        if self.state == TcpFlowState::TimeWait {
            self.entered_time_wait_at = Some(Instant::now());
        }
        self.touch();
    }

    /// The remote (proxy-side) peer closed its write half: we must FIN the client.
    pub fn on_remote_eof(&mut self) {
        self.state = match self.state {
            TcpFlowState::Established => TcpFlowState::FinWait,
            TcpFlowState::CloseWait => TcpFlowState::LastAck,
            other => other,
        };
        self.touch();
    }

    /// Client ACKed our FIN while we were in LAST_ACK: the flow is fully done.
    pub fn on_last_ack_acked(&mut self) {
        if self.state == TcpFlowState::LastAck {
            self.state = TcpFlowState::Closed;
        }
    }

    pub fn on_rst(&mut self) {
        self.state = TcpFlowState::Closed;
    }

    pub fn is_time_wait_expired(&self, now: Instant) -> bool {
        matches!(self.state, TcpFlowState::TimeWait)
            && self
                .entered_time_wait_at
                .is_some_and(|t| now.saturating_duration_since(t) >= TIME_WAIT_DURATION)
    }

    pub fn is_terminal(&self) -> bool {
        self.state == TcpFlowState::Closed
    }

    pub fn handshake_done(&self) -> bool {
        self.state != TcpFlowState::SynRcvd
    }
}

/// `a` is strictly before `b` in sequence-number space, accounting for wraparound (RFC 1323
/// §4.2's comparison trick: treat the wrapping difference as a signed 32-bit value).
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is strictly after `b` in sequence-number space, accounting for wraparound.
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_syn_rcvd_to_established() {
        let mut flow = TcpFlow::new(1000, 65535);
        assert_eq!(flow.state, TcpFlowState::SynRcvd);
        flow.on_established();
        assert_eq!(flow.state, TcpFlowState::Established);
    }

    #[test]
    fn client_initiated_close_sequence() {
        let mut flow = TcpFlow::new(1000, 65535);
        flow.on_established();
        flow.on_client_fin();
        assert_eq!(flow.state, TcpFlowState::CloseWait);
        flow.on_remote_eof();
        assert_eq!(flow.state, TcpFlowState::LastAck);
        flow.on_last_ack_acked();
        assert_eq!(flow.state, TcpFlowState::Closed);
        assert!(flow.is_terminal());
    }

    #[test]
    fn server_initiated_close_sequence() {
        let mut flow = TcpFlow::new(1000, 65535);
        flow.on_established();
        flow.on_remote_eof();
        assert_eq!(flow.state, TcpFlowState::FinWait);
        flow.on_client_fin();
        assert_eq!(flow.state, TcpFlowState::TimeWait);
        assert!(flow.entered_time_wait_at.is_some());
    }

    #[test]
    fn rst_is_immediately_terminal_from_any_state() {
        let mut flow = TcpFlow::new(1000, 65535);
        flow.on_established();
        flow.on_rst();
        assert!(flow.is_terminal());
    }

    #[test]
    fn time_wait_expires_after_duration() {
        let mut flow = TcpFlow::new(1000, 65535);
        flow.state = TcpFlowState::TimeWait;
        flow.entered_time_wait_at = Some(Instant::now() - Duration::from_secs(60));
        assert!(flow.is_time_wait_expired(Instant::now()));
    }

    #[test]
    fn seq_comparisons_handle_wraparound() {
        assert!(seq_lt(100, 200));
        assert!(seq_gt(200, 100));
        assert!(seq_lt(u32::MAX - 10, 5)); // wraps past u32::MAX
        assert!(seq_gt(5, u32::MAX - 10));
        assert!(!seq_lt(100, 100));
        assert!(!seq_gt(100, 100));
    }

    #[test]
    fn sequence_numbers_advance_with_data() {
        let mut flow = TcpFlow::new(1000, 65535);
        flow.on_established();
        flow.on_data(100);
        assert_eq!(flow.client_next_seq, 1101);
        flow.on_server_bytes_sent(50);
        assert_eq!(flow.server_next_seq, flow.server_isn.wrapping_add(1).wrapping_add(50));
    }
}
