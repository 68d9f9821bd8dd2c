//! ISO-TP request/response tests against a simulated ECU on the mock bus

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::time::Instant;

use common::{can1, EngineHarness};
use vehicle_poller::testing::{
    isotp_consecutive, isotp_first, isotp_flow_control, isotp_single, padded_frame, SinkEvent,
};
use vehicle_poller::uds::encode_request;
use vehicle_poller::{
    NegativeResponseCode, PollEntry, PollFailure, PollPayload, PollerConfig, Protocol,
    SequencePolicy, ISOTP_MAX_LEN,
};

fn read_1234() -> PollEntry {
    PollEntry::new(0x7E0, 0x7E8, 0x22, 0x1234).with_intervals([1; 4])
}

fn reply(offset: u16, data: &[u8], remain: u16) -> SinkEvent {
    SinkEvent::Reply {
        module_id: 0x7E8,
        service_type: 0x22,
        pid: 0x1234,
        offset,
        data: data.to_vec(),
        remain,
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_frame_request_and_reply() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, 0x7E0);
    assert!(!sent[0].extended);
    assert_eq!(sent[0].data, [0x03, 0x22, 0x12, 0x34, 0x55, 0x55, 0x55, 0x55]);
    assert_eq!(h.status().wait, 2);

    h.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x12, 0x34, 0xA1, 0xA2, 0xA3, 0xA4]))
        .await;

    assert_eq!(h.sink.results(), vec![reply(0, &[0xA1, 0xA2, 0xA3, 0xA4], 0)]);
    assert_eq!(h.status().wait, 0);
    // throttled: nothing chained in this tick
    assert!(h.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_multi_frame_reply_sends_one_flow_control() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;
    h.sent();

    h.receive(isotp_first(can1(), 0x7E8, 20, &[0x62, 0x12, 0x34, 1, 2, 3]))
        .await;
    let fc = h.sent();
    assert_eq!(fc.len(), 1);
    assert_eq!(fc[0].id, 0x7E0);
    assert_eq!(fc[0].data, [0x30, 0x00, 25, 0x55, 0x55, 0x55, 0x55, 0x55]);

    h.receive(isotp_consecutive(can1(), 0x7E8, 1, &[4, 5, 6, 7, 8, 9, 10]))
        .await;
    h.receive(isotp_consecutive(can1(), 0x7E8, 2, &[11, 12, 13, 14, 15, 16, 17]))
        .await;
    assert!(h.sent().is_empty());

    assert_eq!(
        h.sink.results(),
        vec![
            reply(0, &[1, 2, 3], 14),
            reply(3, &[4, 5, 6, 7, 8, 9, 10], 7),
            reply(10, &[11, 12, 13, 14, 15, 16, 17], 0),
        ]
    );
    assert_eq!(h.sink.reply_data(), (1..=17).collect::<Vec<u8>>());
    assert_eq!(h.status().wait, 0);
}

#[tokio::test(start_paused = true)]
async fn test_configured_flow_control_septime() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.engine.set_fc_septime(0xF3);
    h.tick().await;
    h.sent();

    h.receive(isotp_first(can1(), 0x7E8, 12, &[0x62, 0x12, 0x34, 1, 2, 3]))
        .await;
    assert_eq!(h.sent_data(), vec![(0x7E0, vec![0x30, 0x00, 0xF3])]);
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_frame_tail_padding_ignored() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;

    h.receive(isotp_first(can1(), 0x7E8, 9, &[0x62, 0x12, 0x34, 1, 2, 3]))
        .await;
    h.receive(isotp_consecutive(can1(), 0x7E8, 1, &[4, 5, 6])).await;

    assert_eq!(h.sink.reply_data(), vec![1, 2, 3, 4, 5, 6]);
}

/// Multi frame request: 20 data bytes behind `2E 12 34`
fn write_request() -> PollEntry {
    let payload: Vec<u8> = (0x80..0x80 + 20).collect();
    PollEntry::new(0x7E0, 0x7E8, 0x2E, 0x1234)
        .with_payload(PollPayload::from_slice(&payload))
        .with_intervals([1; 4])
}

#[tokio::test(start_paused = true)]
async fn test_flow_control_block_size_and_separation() {
    let mut h = EngineHarness::with_list(vec![write_request()]);
    h.tick().await;

    assert_eq!(
        h.sent_data(),
        vec![(0x7E0, vec![0x10, 23, 0x2E, 0x12, 0x34, 0x80, 0x81, 0x82])]
    );

    let start = Instant::now();
    h.receive(isotp_flow_control(can1(), 0x7E8, 0, 2, 10)).await;
    assert_eq!(
        h.sent_data(),
        vec![
            (0x7E0, vec![0x21, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89]),
            (0x7E0, vec![0x22, 0x8A, 0x8B, 0x8C, 0x8D, 0x8E, 0x8F, 0x90]),
        ]
    );
    assert!(start.elapsed() >= Duration::from_millis(10));
    assert_eq!(h.status().wait, 2);

    h.receive(isotp_flow_control(can1(), 0x7E8, 0, 2, 10)).await;
    assert_eq!(h.sent_data(), vec![(0x7E0, vec![0x23, 0x91, 0x92, 0x93])]);

    h.receive(isotp_single(can1(), 0x7E8, &[0x6E, 0x12, 0x34])).await;
    assert_eq!(
        h.sink.results(),
        vec![SinkEvent::Reply {
            module_id: 0x7E8,
            service_type: 0x2E,
            pid: 0x1234,
            offset: 0,
            data: vec![],
            remain: 0,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_frame_index_wraps() {
    let payload: Vec<u8> = (0..120u8).map(|b| b | 0x80).collect();
    let entry = PollEntry::new(0x7E0, 0x7E8, 0x2E, 0x1234)
        .with_payload(PollPayload::from_slice(&payload))
        .with_intervals([1; 4]);
    let mut h = EngineHarness::with_list(vec![entry]);
    h.tick().await;
    h.sent();

    h.receive(isotp_flow_control(can1(), 0x7E8, 0, 0, 0)).await;
    let sent = h.sent();
    // 117 bytes after the first frame
    assert_eq!(sent.len(), 17);
    let indices: Vec<u8> = sent.iter().map(|f| f.data[0]).collect();
    let mut expected: Vec<u8> = (1..=15).map(|i| 0x20 | i).collect();
    expected.extend([0x20, 0x21]);
    assert_eq!(indices, expected);
    assert!(sent.iter().all(|f| f.dlc == 8));
}

#[tokio::test(start_paused = true)]
async fn test_flow_control_wait_and_abort() {
    let mut h = EngineHarness::with_list(vec![write_request()]);
    h.tick().await;
    h.sent();

    h.receive(isotp_flow_control(can1(), 0x7E8, 1, 0, 0)).await;
    assert!(h.sent().is_empty());
    assert_eq!(h.status().wait, 3);

    h.receive(isotp_flow_control(can1(), 0x7E8, 2, 0, 0)).await;
    assert!(h.sent().is_empty());

    // nothing left to send, a late clear to send is ignored
    h.receive(isotp_flow_control(can1(), 0x7E8, 0, 0, 0)).await;
    assert!(h.sent().is_empty());

    // the response is still accepted
    h.receive(isotp_single(can1(), 0x7E8, &[0x6E, 0x12, 0x34])).await;
    assert_eq!(h.sink.results().len(), 1);
}

#[rstest]
#[case::lenient_repeat(SequencePolicy::Lenient, 0, true)]
#[case::lenient_exact(SequencePolicy::Lenient, 1, true)]
#[case::lenient_skip(SequencePolicy::Lenient, 2, false)]
#[case::strict_repeat(SequencePolicy::Strict, 0, false)]
#[case::strict_exact(SequencePolicy::Strict, 1, true)]
#[tokio::test(start_paused = true)]
async fn test_consecutive_index_policy(
    #[case] policy: SequencePolicy,
    #[case] index: u8,
    #[case] accepted: bool,
) {
    let config = PollerConfig {
        isotp_sequence: policy,
        ..Default::default()
    };
    let mut h = EngineHarness::new(config);
    h.engine.set_list(common::list(vec![read_1234()]), Some(can1()));
    h.tick().await;

    h.receive(isotp_first(can1(), 0x7E8, 13, &[0x62, 0x12, 0x34, 1, 2, 3]))
        .await;
    h.receive(isotp_consecutive(can1(), 0x7E8, index, &[4, 5, 6, 7, 8, 9, 10]))
        .await;

    if accepted {
        assert_eq!(h.sink.reply_data(), (1..=10).collect::<Vec<u8>>());
        assert_eq!(h.status().wait, 0);
    } else {
        assert_eq!(h.sink.reply_data(), vec![1, 2, 3]);
        // remaining frames are ignored until the wait runs out
        assert_eq!(h.status().wait, 2);
        h.receive(isotp_consecutive(can1(), 0x7E8, 1, &[4, 5, 6, 7, 8, 9, 10]))
            .await;
        assert_eq!(h.sink.reply_data(), vec![1, 2, 3]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_aborted_poll_times_out_and_polling_continues() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;
    h.sent();
    h.receive(isotp_first(can1(), 0x7E8, 20, &[0x62, 0x12, 0x34, 1, 2, 3]))
        .await;
    h.receive(isotp_consecutive(can1(), 0x7E8, 3, &[0; 7])).await;
    h.sent();

    h.tick().await;
    assert!(h.sent().is_empty());
    assert_eq!(h.status().wait, 1);
    // wait expired, next pass starts
    h.tick().await;
    assert_eq!(h.sent_data(), vec![(0x7E0, vec![0x03, 0x22, 0x12, 0x34])]);
    assert_eq!(h.status().ticker, 1);
}

#[tokio::test(start_paused = true)]
async fn test_response_pending_extends_wait() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;

    for expected_wait in 3..=5 {
        h.receive(isotp_single(can1(), 0x7E8, &[0x7F, 0x22, 0x78])).await;
        assert_eq!(h.status().wait, expected_wait);
    }
    assert!(h.sink.results().is_empty());

    h.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x12, 0x34, 0x42])).await;
    assert_eq!(h.sink.results(), vec![reply(0, &[0x42], 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_negative_response_delivered_once() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;

    h.receive(isotp_single(can1(), 0x7E8, &[0x7F, 0x22, 0x78])).await;
    h.receive(isotp_single(can1(), 0x7E8, &[0x7F, 0x22, 0x31])).await;
    // expired poll
    h.receive(isotp_single(can1(), 0x7E8, &[0x7F, 0x22, 0x31])).await;

    assert_eq!(
        h.sink.results(),
        vec![SinkEvent::Error {
            module_id: 0x7E8,
            service_type: 0x22,
            pid: 0x1234,
            failure: PollFailure::Negative(NegativeResponseCode::RequestOutOfRange),
        }]
    );
    assert_eq!(h.status().wait, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_and_foreign_frames_dropped() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;

    // other PID, other service, other module, unknown frame type
    h.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x43, 0x21, 0x01])).await;
    h.receive(isotp_single(can1(), 0x7E8, &[0x61, 0x12, 0x01])).await;
    h.receive(isotp_single(can1(), 0x7E9, &[0x62, 0x12, 0x34, 0x01])).await;
    h.receive(padded_frame(can1(), 0x7E8, &[0x40, 0x62, 0x12, 0x34])).await;

    assert!(h.sink.results().is_empty());
    assert_eq!(h.status().wait, 2);

    h.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x12, 0x34, 0x07])).await;
    assert_eq!(h.sink.results(), vec![reply(0, &[0x07], 0)]);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_request() {
    let entry = PollEntry::new(0x7DF, 0, 0x09, 0x02).with_intervals([1; 4]);
    let mut h = EngineHarness::with_list(vec![entry]);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![(0x7DF, vec![0x02, 0x09, 0x02])]);

    h.receive(isotp_first(can1(), 0x7EA, 12, &[0x49, 0x02, 0x01, b'W', b'V', b'W']))
        .await;
    // flow control goes to the responder's request id
    assert_eq!(h.sent_data(), vec![(0x7E2, vec![0x30, 0x00, 25])]);

    h.receive(isotp_consecutive(can1(), 0x7EA, 1, b"ZZZ1234")).await;
    assert_eq!(
        h.sink.results(),
        vec![
            SinkEvent::Reply {
                module_id: 0x7EA,
                service_type: 0x09,
                pid: 0x02,
                offset: 0,
                data: vec![0x01, b'W', b'V', b'W'],
                remain: 6,
            },
            SinkEvent::Reply {
                module_id: 0x7EA,
                service_type: 0x09,
                pid: 0x02,
                offset: 4,
                data: b"ZZZ123".to_vec(),
                remain: 0,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_extended_addressing() {
    let entry = PollEntry::new(0x6F112, 0x612F1, 0x22, 0x1234)
        .with_protocol(Protocol::IsoTpExtAddr)
        .with_intervals([1; 4]);
    let mut h = EngineHarness::with_list(vec![entry]);
    h.tick().await;
    assert_eq!(
        h.sent_data(),
        vec![(0x6F1, vec![0x12, 0x03, 0x22, 0x12, 0x34])]
    );

    h.receive(padded_frame(can1(), 0x612, &[0xF1, 0x10, 0x0A, 0x62, 0x12, 0x34, 1, 2]))
        .await;
    assert_eq!(h.sent_data(), vec![(0x6F1, vec![0x12, 0x30, 0x00, 25])]);

    // address byte of another module
    h.receive(padded_frame(can1(), 0x612, &[0xF2, 0x21, 9, 9, 9, 9, 9, 9]))
        .await;
    h.receive(padded_frame(can1(), 0x612, &[0xF1, 0x21, 3, 4, 5, 6, 7, 8]))
        .await;

    assert_eq!(h.sink.reply_data(), vec![1, 2, 3, 4, 5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_extended_frame_ids() {
    let entry = PollEntry::new(0x18DA10F1, 0x18DAF110, 0x22, 0x1234)
        .with_protocol(Protocol::IsoTpExtFrame)
        .with_intervals([1; 4]);
    let mut h = EngineHarness::with_list(vec![entry]);
    h.tick().await;

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, 0x18DA10F1);
    assert!(sent[0].extended);

    h.receive(isotp_single(can1(), 0x18DAF110, &[0x62, 0x12, 0x34, 0x99]))
        .await;
    assert_eq!(h.sink.reply_data(), vec![0x99]);
}

#[tokio::test(start_paused = true)]
async fn test_transmit_failure() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.bus.set_online(false);
    h.tick().await;

    assert_eq!(
        h.sink.events(),
        vec![
            SinkEvent::Error {
                module_id: 0,
                service_type: 0x22,
                pid: 0x1234,
                failure: PollFailure::TransmitFailed,
            },
            SinkEvent::TxResult {
                tx_id: 0x7E0,
                service_type: 0x22,
                pid: 0x1234,
                success: false,
            },
        ]
    );
    assert_eq!(h.status().wait, 0);
}

/// Reassemble the request written by the engine, granting a first frame an
/// unlimited block without separation time
async fn sent_request(h: &mut EngineHarness) -> Vec<u8> {
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let first = sent[0].data;
    if first[0] >> 4 == 0 {
        return first[1..1 + usize::from(first[0] & 0x0f)].to_vec();
    }

    assert_eq!(first[0] >> 4, 1);
    let total = usize::from(first[0] & 0x0f) << 8 | usize::from(first[1]);
    let mut data = first[2..].to_vec();
    h.receive(isotp_flow_control(can1(), 0x7E8, 0, 0, 0)).await;
    for (i, frame) in h.sent().iter().enumerate() {
        assert_eq!(frame.data[0], 0x20 | ((i + 1) & 0x0f) as u8);
        data.extend_from_slice(&frame.data[1..]);
    }
    assert!(data.len() >= total);
    data.truncate(total);
    data
}

#[rstest]
#[case::no_pid(0x14, 0)]
#[case::byte_pid(0x21, 0x42)]
#[case::word_pid(0x2E, 0x1234)]
#[tokio::test(start_paused = true)]
async fn test_request_framing_all_lengths(#[case] service: u8, #[case] pid: u16) {
    let header = encode_request(service, pid, &[]);
    let max = ISOTP_MAX_LEN - header.len();
    let lengths = (0..=300).chain((301..max).step_by(97)).chain([max]);

    for len in lengths {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        let entry = PollEntry::new(0x7E0, 0x7E8, service, pid)
            .with_payload(PollPayload::from_slice(&payload))
            .with_intervals([1; 4]);
        let mut h = EngineHarness::with_list(vec![entry]);
        h.tick().await;

        let mut expected = header.clone();
        expected.extend_from_slice(&payload);
        assert_eq!(sent_request(&mut h).await, expected, "payload length {}", len);
    }
}

#[tokio::test(start_paused = true)]
async fn test_maximum_length_reply() {
    let mut h = EngineHarness::with_list(vec![read_1234()]);
    h.tick().await;
    h.sent();

    let body: Vec<u8> = (0..ISOTP_MAX_LEN - 3).map(|i| (i % 251) as u8).collect();
    let mut response = vec![0x62, 0x12, 0x34];
    response.extend_from_slice(&body);

    h.receive(isotp_first(can1(), 0x7E8, ISOTP_MAX_LEN as u16, &response[..6]))
        .await;
    assert_eq!(h.sent_data(), vec![(0x7E0, vec![0x30, 0x00, 25])]);
    for (i, chunk) in response[6..].chunks(7).enumerate() {
        h.receive(isotp_consecutive(can1(), 0x7E8, ((i + 1) & 0x0f) as u8, chunk))
            .await;
    }

    let last_frames = h
        .sink
        .results()
        .iter()
        .filter(|e| matches!(e, SinkEvent::Reply { remain: 0, .. }))
        .count();
    assert_eq!(last_frames, 1);
    assert_eq!(h.sink.reply_data(), body);
    assert_eq!(h.status().wait, 0);
    assert!(h.sent().is_empty());
}
