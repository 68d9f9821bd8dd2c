//! Poll list scheduling: intervals, throttling, states, pause and ticks

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;

use common::{can1, can2, EngineHarness, RuntimeHarness};
use vehicle_poller::testing::{isotp_single, BusSignal};
use vehicle_poller::{PollEntry, PollerConfig, TickKind};

fn entry(pid: u16, intervals: [u16; 4]) -> PollEntry {
    PollEntry::new(0x7E0, 0x7E8, 0x22, pid).with_intervals(intervals)
}

fn request(pid: u16) -> (u32, Vec<u8>) {
    (0x7E0, vec![0x03, 0x22, (pid >> 8) as u8, pid as u8])
}

async fn answer(h: &mut EngineHarness, pid: u16) {
    h.receive(isotp_single(can1(), 0x7E8, &[0x62, (pid >> 8) as u8, pid as u8, 0x00]))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_intervals_follow_ticker() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4]), entry(0x0003, [3; 4])]);
    h.engine.set_sequence_max(0);

    let mut polled = Vec::new();
    for _ in 0..6 {
        h.tick().await;
        loop {
            let sent = h.sent_data();
            let Some((_, data)) = sent.first() else {
                break;
            };
            let pid = u16::from(data[2]) << 8 | u16::from(data[3]);
            polled.push((h.status().ticker, pid));
            answer(&mut h, pid).await;
        }
    }
    assert_eq!(
        polled,
        vec![
            (0, 1),
            (0, 3),
            (1, 1),
            (2, 1),
            (3, 1),
            (3, 3),
            (4, 1),
            (5, 1),
        ]
    );
}

#[rstest]
#[case::unlimited(0, 3)]
#[case::one(1, 1)]
#[case::two(2, 2)]
#[tokio::test(start_paused = true)]
async fn test_throttling_limits_chained_polls(#[case] sequence_max: u8, #[case] expected: usize) {
    let mut h = EngineHarness::with_list(vec![
        entry(0x0001, [1; 4]),
        entry(0x0002, [1; 4]),
        entry(0x0003, [1; 4]),
    ]);
    h.engine.set_sequence_max(sequence_max);

    h.tick().await;
    let mut polled = 0;
    while let Some((_, data)) = h.sent_data().first().cloned() {
        polled += 1;
        answer(&mut h, u16::from(data[2]) << 8 | u16::from(data[3])).await;
    }
    assert_eq!(polled, expected);
}

#[tokio::test(start_paused = true)]
async fn test_secondary_tick_dispatches_without_timeouts() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4]), entry(0x0002, [1; 4])]);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0001)]);

    // no wait countdown on secondary ticks
    h.engine.tick(TickKind::Secondary).await;
    h.engine.tick(TickKind::Secondary).await;
    assert_eq!(h.status().wait, 2);
    assert!(h.sent().is_empty());

    answer(&mut h, 0x0001).await;
    h.engine.tick(TickKind::Secondary).await;
    assert_eq!(h.sent_data(), vec![request(0x0002)]);
    answer(&mut h, 0x0002).await;

    // pass complete, the ticker only advances on a primary tick
    h.engine.tick(TickKind::Secondary).await;
    assert!(h.sent().is_empty());
    assert_eq!(h.status().ticker, 0);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0001)]);
    assert_eq!(h.status().ticker, 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_state_selects_intervals() {
    let mut h = EngineHarness::with_list(vec![
        entry(0x0001, [0, 1, 0, 0]),
        entry(0x0002, [1, 0, 0, 0]),
    ]);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0002)]);
    answer(&mut h, 0x0002).await;

    h.engine.set_state(1);
    let status = h.status();
    assert_eq!(status.state, 1);
    assert_eq!(status.ticker, 0);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0001)]);

    // out of range states are clamped
    h.engine.set_state(9);
    assert_eq!(h.status().state, 3);
    assert_eq!(h.status().wait, 0);
    h.tick().await;
    assert!(h.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4])]);
    h.engine.set_paused(true);
    h.tick().await;
    h.tick().await;
    assert!(h.sent().is_empty());
    assert!(h.status().paused);

    h.engine.set_paused(false);
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0001)]);
}

#[tokio::test(start_paused = true)]
async fn test_new_list_replaces_running_poll() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4])]);
    h.tick().await;
    h.sent();
    assert_eq!(h.status().wait, 2);

    h.engine
        .set_list(common::list(vec![entry(0x0002, [1; 4])]), Some(can1()));
    let status = h.status();
    assert_eq!(status.wait, 0);
    assert_eq!(status.list_len, 1);

    // answer to the dropped poll is ignored
    answer(&mut h, 0x0001).await;
    assert!(h.sink.results().is_empty());

    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0002)]);
}

#[tokio::test(start_paused = true)]
async fn test_entries_on_other_bus_skipped() {
    let config = PollerConfig {
        sequence_max: 0,
        ..Default::default()
    };
    let mut h = EngineHarness::new(config);
    h.engine.set_list(
        common::list(vec![entry(0x0001, [1; 4]).on_bus(2), entry(0x0002, [1; 4])]),
        Some(can1()),
    );
    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0002)]);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_polls_each_bus() {
    let rt = RuntimeHarness::new(2);
    rt.handle
        .set_pid_list(
            vec![entry(0x0001, [1; 4]), entry(0x0002, [1; 4]).on_bus(2)],
            can1(),
        )
        .await
        .unwrap();
    rt.tick().await;
    assert_eq!(rt.sent_data(1), vec![request(0x0001)]);
    assert_eq!(rt.sent_data(2), vec![request(0x0002)]);

    // a response on one bus does not touch the other
    rt.receive(isotp_single(can2(), 0x7E8, &[0x62, 0x00, 0x02, 0x11]))
        .await;
    let status = rt.sync().await;
    assert_eq!(status[0].wait, 2);
    assert_eq!(status[1].wait, 0);

    // state change on bus 2 only
    rt.handle.set_state(2, Some(can2())).await.unwrap();
    let status = rt.sync().await;
    assert_eq!(status[0].state, 0);
    assert_eq!(status[1].state, 2);

    rt.handle.clear_pid_list().await.unwrap();
    let status = rt.sync().await;
    assert!(status.iter().all(|s| s.list_len == 0));
}

#[tokio::test(start_paused = true)]
async fn test_runtime_settings_reach_engines() {
    let rt = RuntimeHarness::new(2);
    rt.handle.set_throttling(4).await.unwrap();
    rt.handle.pause().await.unwrap();
    let status = rt.sync().await;
    assert!(status.iter().all(|s| s.sequence_max == 4 && s.paused));

    rt.handle.resume().await.unwrap();
    let status = rt.sync().await;
    assert!(status.iter().all(|s| !s.paused));
    assert_eq!(status[1].bus, can2());
}

#[tokio::test(start_paused = true)]
async fn test_run_finished_once_per_pass() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4]), entry(0x0002, [1; 4])]);
    h.engine.set_sequence_max(0);

    h.tick().await;
    answer(&mut h, 0x0001).await;
    assert_eq!(h.sink.take_signals(), vec![BusSignal::StateTicker(can1())]);
    answer(&mut h, 0x0002).await;
    assert_eq!(h.sink.take_signals(), vec![BusSignal::RunFinished(can1())]);

    // secondary ticks neither tick the state nor finish the pass again
    h.engine.tick(TickKind::Secondary).await;
    assert!(h.sink.take_signals().is_empty());
    assert_eq!(h.sent_data(), vec![request(0x0001), request(0x0002)]);

    h.tick().await;
    assert_eq!(h.sent_data(), vec![request(0x0001)]);
    assert_eq!(h.sink.take_signals(), vec![BusSignal::StateTicker(can1())]);
}

#[tokio::test(start_paused = true)]
async fn test_run_finished_when_last_entry_throttled() {
    let mut h = EngineHarness::with_list(vec![entry(0x0001, [1; 4])]);

    h.tick().await;
    answer(&mut h, 0x0001).await;
    assert_eq!(h.sink.take_signals(), vec![BusSignal::StateTicker(can1())]);

    // the pass closes on the next primary tick
    h.tick().await;
    assert_eq!(
        h.sink.take_signals(),
        vec![BusSignal::StateTicker(can1()), BusSignal::RunFinished(can1())]
    );
    assert_eq!(h.status().ticker, 1);
}

#[tokio::test(start_paused = true)]
async fn test_time_between_success_delays_chained_poll() {
    let config = PollerConfig {
        tick_ms: 0,
        sequence_max: 0,
        time_between_success_ms: 100,
        ..Default::default()
    };
    let rt = RuntimeHarness::with_config(1, config);
    rt.handle
        .set_pid_list(
            vec![entry(0x0001, [1; 4]), entry(0x0002, [1; 4]), entry(0x0003, [1; 4])],
            can1(),
        )
        .await
        .unwrap();
    rt.tick().await;
    assert_eq!(rt.sent_data(1), vec![request(0x0001)]);

    rt.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x00, 0x01, 0x11]))
        .await;
    assert!(rt.sent_data(1).is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    rt.sync().await;
    assert!(rt.sent_data(1).is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    rt.sync().await;
    assert_eq!(rt.sent_data(1), vec![request(0x0002)]);

    // without delay the next poll follows the reply directly
    rt.handle.set_time_between_success(0).await.unwrap();
    rt.receive(isotp_single(can1(), 0x7E8, &[0x62, 0x00, 0x02, 0x22]))
        .await;
    assert_eq!(rt.sent_data(1), vec![request(0x0003)]);
}
