//! Two sessions wired back to back through an in-memory transport
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use rtcstack_transport::{
    FrameType, IntraRequestKind, KeyFrameRequestMethod, Module, NackMethod, PayloadSpec,
    ProcessThread, RtcpMode, RtcpPacketMask, RtpData, RtpHeader, RtpHeaderInfo, RtpSession,
    SessionOptions, SimulatedClock, Transport, TransportError, VideoFeedback,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const VP8: u8 = 100;

/// Queues everything a session sends; selected RTP sequence numbers are dropped once
#[derive(Default)]
struct LoopbackTransport {
    queue: Mutex<VecDeque<Vec<u8>>>,
    drop_once: Mutex<HashSet<u16>>,
    rtcp_sent: Mutex<usize>,
}

impl LoopbackTransport {
    fn drop_sequence_number(&self, seq: u16) {
        self.drop_once.lock().unwrap().insert(seq);
    }

    /// Deliver everything queued so far to `to`
    fn pump(&self, to: &RtpSession) -> usize {
        let packets: Vec<Vec<u8>> = self.queue.lock().unwrap().drain(..).collect();
        let count = packets.len();
        for packet in packets {
            // Packets for unknown payloads or with RTCP off are fine to refuse
            let _ = to.incoming_packet(&packet);
        }
        count
    }

    fn rtcp_sent(&self) -> usize {
        *self.rtcp_sent.lock().unwrap()
    }
}

impl Transport for LoopbackTransport {
    fn send_rtp(&self, packet: &[u8]) -> bool {
        if let Ok((header, _)) = RtpHeader::parse(packet) {
            if self.drop_once.lock().unwrap().remove(&header.sequence_number) {
                return true;
            }
        }
        self.queue.lock().unwrap().push_back(packet.to_vec());
        true
    }

    fn send_rtcp(&self, packet: &[u8]) -> bool {
        *self.rtcp_sent.lock().unwrap() += 1;
        self.queue.lock().unwrap().push_back(packet.to_vec());
        true
    }
}

#[derive(Default)]
struct Endpoint {
    payloads: Mutex<Vec<(u16, Vec<u8>)>>,
    intra_requests: Mutex<Vec<IntraRequestKind>>,
}

impl RtpData for Endpoint {
    fn on_received_payload_data(&self, payload: &[u8], info: &RtpHeaderInfo) {
        self.payloads
            .lock()
            .unwrap()
            .push((info.header.sequence_number, payload.to_vec()));
    }
}

impl VideoFeedback for Endpoint {
    fn on_received_intra_frame_request(&self, kind: IntraRequestKind, _stream_idx: u8) {
        self.intra_requests.lock().unwrap().push(kind);
    }
}

struct Peer {
    session: Arc<RtpSession>,
    transport: Arc<LoopbackTransport>,
    endpoint: Arc<Endpoint>,
}

fn peer(clock: &Arc<SimulatedClock>, seed: u64, cname: &str) -> Peer {
    let session = RtpSession::new(SessionOptions::new(false, clock.clone()).with_seed(seed));
    let transport = Arc::new(LoopbackTransport::default());
    let endpoint = Arc::new(Endpoint::default());

    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let data: Arc<dyn RtpData> = endpoint.clone();
    let feedback: Arc<dyn VideoFeedback> = endpoint.clone();
    session.register_transport(&dyn_transport).unwrap();
    session.register_incoming_data_callback(&data).unwrap();
    session.register_video_feedback(&feedback).unwrap();

    session.register_send_payload(PayloadSpec::video(VP8, "VP8")).unwrap();
    session.register_receive_payload(PayloadSpec::video(VP8, "VP8")).unwrap();
    session.set_rtcp_status(RtcpMode::Compound);
    session.set_cname(cname).unwrap();
    Peer {
        session,
        transport,
        endpoint,
    }
}

fn send_frames(peer: &Peer, count: u32) {
    for i in 0..count {
        let frame = format!("frame-{}", i);
        peer.session
            .send_outgoing_data(FrameType::DeltaFrame, VP8, i * 3000, frame.as_bytes(), None)
            .unwrap();
    }
}

fn setup() -> (Arc<SimulatedClock>, Peer, Peer) {
    rtcstack_logging::init_test_logging();
    let clock = Arc::new(SimulatedClock::new(1_000_000));
    let alice = peer(&clock, 1, "alice@loopback");
    let bob = peer(&clock, 2, "bob@loopback");
    (clock, alice, bob)
}

#[test]
fn test_media_reaches_remote_data_callback() {
    let (_clock, alice, bob) = setup();
    alice.session.set_sending_status(true).unwrap();
    send_frames(&alice, 3);
    assert_eq!(alice.transport.pump(&bob.session), 3);

    let received = bob.endpoint.payloads.lock().unwrap().clone();
    assert_eq!(received.len(), 3);
    assert_eq!(received[2].1, b"frame-2".to_vec());
    assert_eq!(bob.session.remote_ssrc(), Some(alice.session.ssrc()));
    assert_eq!(
        bob.session.statistics_rtp(false).unwrap().extended_max_sequence & 0xFFFF,
        u32::from(received[2].0)
    );
}

#[test]
fn test_lost_packet_recovered_by_nack() {
    let (clock, alice, bob) = setup();
    alice.session.set_store_packets_status(true, 200).unwrap();
    bob.session.set_nack_status(NackMethod::Rtcp);
    alice.session.set_sequence_number(1000);
    alice.session.set_sending_status(true).unwrap();

    alice.transport.drop_sequence_number(1002);
    send_frames(&alice, 5);
    alice.transport.pump(&bob.session);
    assert_eq!(bob.endpoint.payloads.lock().unwrap().len(), 4);
    assert_eq!(bob.session.nack_stats().unwrap().missing, 1);

    // Bob's tick reports the gap, Alice resends from her history
    clock.advance_ms(10);
    bob.session.process().unwrap();
    bob.transport.pump(&alice.session);
    assert_eq!(alice.session.retransmission_stats().packets_resent, 1);
    alice.transport.pump(&bob.session);

    let mut sequence_numbers: Vec<u16> = bob
        .endpoint
        .payloads
        .lock()
        .unwrap()
        .iter()
        .map(|(seq, _)| *seq)
        .collect();
    sequence_numbers.sort_unstable();
    assert_eq!(sequence_numbers, vec![1000, 1001, 1002, 1003, 1004]);
    let stats = bob.session.nack_stats().unwrap();
    assert_eq!(stats.missing, 0);
    assert_eq!(stats.recovered, 1);
}

#[test]
fn test_round_trip_time_from_report_exchange() {
    let (clock, alice, bob) = setup();
    alice.session.set_sending_status(true).unwrap();
    send_frames(&alice, 3);

    alice.session.send_rtcp(RtcpPacketMask::REPORT).unwrap();
    clock.advance_ms(30);
    alice.transport.pump(&bob.session);
    assert_eq!(
        bob.session.remote_sender_info().unwrap().ssrc,
        alice.session.ssrc()
    );

    clock.advance_ms(20);
    bob.session.send_rtcp(RtcpPacketMask::REPORT).unwrap();
    clock.advance_ms(30);
    bob.transport.pump(&alice.session);

    let rtt = alice.session.rtt(bob.session.ssrc()).unwrap();
    assert!((59..=61).contains(&rtt.last_ms), "rtt {}", rtt.last_ms);
    assert_eq!(alice.session.remote_cname(bob.session.ssrc()).unwrap(), "bob@loopback");

    alice.session.reset_rtt(bob.session.ssrc()).unwrap();
    assert!(matches!(
        alice.session.rtt(bob.session.ssrc()),
        Err(TransportError::NotAvailable(_))
    ));
}

#[test]
fn test_goodbye_forgets_remote_sender() {
    let (_clock, alice, bob) = setup();
    alice.session.set_sending_status(true).unwrap();
    send_frames(&alice, 3);
    alice.session.send_rtcp(RtcpPacketMask::REPORT).unwrap();
    alice.transport.pump(&bob.session);
    assert!(bob.session.remote_sender_info().is_ok());

    alice.session.set_sending_status(false).unwrap();
    alice.transport.pump(&bob.session);
    assert!(bob.session.remote_sender_info().is_err());
}

#[test]
fn test_key_frame_request_reaches_sender() {
    let (_clock, alice, bob) = setup();
    alice.session.set_sending_status(true).unwrap();
    send_frames(&alice, 1);
    alice.transport.pump(&bob.session);

    bob.session.request_key_frame().unwrap();
    bob.transport.pump(&alice.session);
    assert_eq!(
        *alice.endpoint.intra_requests.lock().unwrap(),
        vec![IntraRequestKind::Pli]
    );

    bob.session
        .set_key_frame_request_method(KeyFrameRequestMethod::FirRtp);
    bob.session.request_key_frame().unwrap();
    bob.transport.pump(&alice.session);
    assert_eq!(
        alice.endpoint.intra_requests.lock().unwrap().last(),
        Some(&IntraRequestKind::FirOverRtp)
    );
}

#[test]
fn test_process_thread_services_both_sessions() {
    let (clock, alice, bob) = setup();
    let process_thread = ProcessThread::new();
    let alice_module: Arc<dyn Module> = alice.session.clone();
    let bob_module: Arc<dyn Module> = bob.session.clone();
    process_thread.register_module(alice_module).unwrap();
    process_thread.register_module(bob_module).unwrap();

    let pass = process_thread.process_due_modules();
    assert_eq!(pass.processed, 2);
    assert_eq!(alice.transport.rtcp_sent(), 1);
    assert_eq!(bob.transport.rtcp_sent(), 1);

    // Reports are spaced by at least half the video interval
    clock.advance_ms(400);
    process_thread.process_due_modules();
    assert_eq!(alice.transport.rtcp_sent(), 1);
    clock.advance_ms(1200);
    process_thread.process_due_modules();
    assert_eq!(alice.transport.rtcp_sent(), 2);
    assert_eq!(bob.transport.rtcp_sent(), 2);
}
