//! Shared fixtures for the poller integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vehicle_poller::testing::{unpadded, RecordingSink};
use vehicle_poller::{
    BusId, CanFrame, MockBus, PollEntry, PollList, PollerConfig, PollerEngine, PollerHandle,
    PollerRuntime, PollerStatus, TickKind,
};

pub fn can1() -> BusId {
    BusId::new(1).unwrap()
}

pub fn can2() -> BusId {
    BusId::new(2).unwrap()
}

pub fn list(entries: Vec<PollEntry>) -> Option<PollList> {
    Some(Arc::from(entries))
}

/// One engine on a mock bus with a recording sink
pub struct EngineHarness {
    pub bus: Arc<MockBus>,
    pub sink: Arc<RecordingSink>,
    pub engine: PollerEngine,
}

impl EngineHarness {
    pub fn new(config: PollerConfig) -> Self {
        let bus = Arc::new(MockBus::default());
        let sink = Arc::new(RecordingSink::new());
        let engine = PollerEngine::new(can1(), bus.clone(), sink.clone(), &config);
        Self { bus, sink, engine }
    }

    pub fn with_list(entries: Vec<PollEntry>) -> Self {
        let mut harness = Self::new(PollerConfig::default());
        harness.engine.set_list(list(entries), Some(can1()));
        harness
    }

    pub async fn tick(&mut self) {
        self.engine.tick(TickKind::Primary).await;
    }

    pub async fn receive(&mut self, frame: CanFrame) {
        self.engine.handle_frame(frame).await;
    }

    /// Frames written since the last call
    pub fn sent(&self) -> Vec<CanFrame> {
        self.bus.take_written()
    }

    /// (id, data without padding) of frames written since the last call
    pub fn sent_data(&self) -> Vec<(u32, Vec<u8>)> {
        self.sent().iter().map(|f| (f.id, unpadded(f))).collect()
    }

    pub fn status(&self) -> PollerStatus {
        self.engine.status()
    }
}

/// Spawned runtime without internal timer; ticks are driven by the test
pub struct RuntimeHarness {
    pub buses: Vec<Arc<MockBus>>,
    pub sink: Arc<RecordingSink>,
    pub handle: PollerHandle,
}

impl RuntimeHarness {
    pub fn new(bus_count: u8) -> Self {
        Self::with_config(
            bus_count,
            PollerConfig {
                tick_ms: 0,
                ..Default::default()
            },
        )
    }

    pub fn with_config(bus_count: u8, config: PollerConfig) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let (mut runtime, handle) = PollerRuntime::new(config, sink.clone()).unwrap();
        let mut buses = Vec::new();
        for n in 1..=bus_count {
            let bus = Arc::new(MockBus::default());
            runtime.add_bus(BusId::new(n).unwrap(), bus.clone());
            buses.push(bus);
        }
        runtime.spawn();
        Self {
            buses,
            sink,
            handle,
        }
    }

    /// Wait until every command sent so far has been processed
    pub async fn sync(&self) -> Vec<PollerStatus> {
        self.handle.status().await.unwrap()
    }

    pub async fn tick(&self) {
        self.handle.tick(TickKind::Primary).await.unwrap();
        self.sync().await;
    }

    pub async fn receive(&self, frame: CanFrame) {
        self.handle.frame_received(frame).await.unwrap();
        self.sync().await;
    }

    /// (id, data without padding) written to bus `n` (1 based)
    pub fn sent_data(&self, n: usize) -> Vec<(u32, Vec<u8>)> {
        self.buses[n - 1]
            .take_written()
            .iter()
            .map(|f| (f.id, unpadded(f)))
            .collect()
    }

    /// Wait until bus 1 has a single request in flight
    pub async fn wait_single_active(&self) {
        for _ in 0..100 {
            if self.sync().await[0].single_active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("single request did not start");
    }
}
