use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};

use crate::config::AppConfig;
use crate::connectivity::{Connectivity, RestartRequired};
use crate::hardware::{Board, Delay, EchoInput, Level, OutputPin};
use crate::indicator::Indicator;
use crate::messages::{Reading, SPACE_COUNT, Snapshot};
use crate::mqtt::BrokerSession;
use crate::network::NetworkLink;
use crate::occupancy::classify;
use crate::publisher::{PublishOutcome, Publisher};
use crate::report;
use crate::sampler::{Sampler, Sensor};

pub struct Space<O, E> {
    place: u8,
    sensor: Sensor<O, E>,
    indicator: Indicator<O>,
    distance_cm: f32,
}

pub struct Manager<O, E, D, N, B> {
    spaces: [Space<O, E>; SPACE_COUNT],
    sampler: Sampler<D>,
    threshold_cm: f32,
    inter_sensor_delay: Duration,
    loop_delay: Duration,
    connectivity: Connectivity<N, B>,
    publisher: Publisher,
}

impl<O, E, D, N, B> Manager<O, E, D, N, B>
where
    O: OutputPin,
    E: EchoInput,
    D: Delay,
    N: NetworkLink,
    B: BrokerSession,
{
    pub fn new<Bd>(
        board: &mut Bd,
        config: &AppConfig,
        connectivity: Connectivity<N, B>,
        publisher: Publisher,
    ) -> anyhow::Result<Self>
    where
        Bd: Board<Output = O, Echo = E, Delay = D>,
    {
        let mut spaces = Vec::with_capacity(SPACE_COUNT);
        for (i, pins) in config.spaces.iter().enumerate() {
            let sensor = Sensor {
                trigger: board.output(pins.trigger)?,
                echo: board.echo(pins.echo)?,
            };
            let indicator = Indicator::new(board.output(pins.green)?, board.output(pins.red)?);
            spaces.push(Space {
                place: i as u8 + 1,
                sensor,
                indicator,
                distance_cm: 0.0,
            });
        }
        let spaces: [Space<O, E>; SPACE_COUNT] = spaces
            .try_into()
            .map_err(|v: Vec<_>| anyhow!("expected {} spaces, got {}", SPACE_COUNT, v.len()))?;

        let sensing = config.sensing();
        Ok(Manager {
            spaces,
            sampler: Sampler::new(board.delay(), sensing.echo_timeout(), sensing.cm_per_us()),
            threshold_cm: sensing.threshold_cm(),
            inter_sensor_delay: sensing.inter_sensor_delay(),
            loop_delay: sensing.loop_delay(),
            connectivity,
            publisher,
        })
    }

    /// Light every green, then every red, then go dark.
    pub async fn lamp_test(&mut self) {
        info!("LED system test: green");
        self.set_all_lamps(Level::High, Level::Low);
        sleep(Duration::from_secs(1)).await;

        info!("LED system test: red");
        self.set_all_lamps(Level::Low, Level::High);
        sleep(Duration::from_secs(1)).await;

        self.set_all_lamps(Level::Low, Level::Low);
        sleep(Duration::from_millis(500)).await;
        info!("LED system test complete");
    }

    fn set_all_lamps(&mut self, green: Level, red: Level) {
        for space in self.spaces.iter_mut() {
            space.indicator.set_lamps(green, red);
        }
    }

    /// Measure every space once, in order.
    fn sample_pass(&mut self) {
        for i in 0..SPACE_COUNT {
            if i > 0 {
                self.sampler.pause(self.inter_sensor_delay);
            }
            let space = &mut self.spaces[i];
            space.distance_cm = self.sampler.measure(&mut space.sensor);
            debug!("Place {}: {:.1} cm", space.place, space.distance_cm);
        }
    }

    /// Classify the latest pass, drive the indicators and return the snapshot.
    fn classify_and_actuate(&mut self) -> Snapshot {
        let threshold_cm = self.threshold_cm;
        let readings = self.spaces.each_mut().map(|space| {
            let occupancy = classify(space.distance_cm, threshold_cm);
            space.indicator.apply(occupancy);
            Reading {
                place: space.place,
                distance_cm: space.distance_cm,
                occupancy,
            }
        });
        Snapshot::new(readings)
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) -> Result<Snapshot, RestartRequired> {
        self.connectivity.ensure_session().await?;
        let received = self.connectivity.service().await;
        debug!(
            "network {:?}, broker {:?}, {} inbound",
            self.connectivity.network_state(),
            self.connectivity.broker_state(),
            received
        );

        self.sample_pass();
        let snapshot = self.classify_and_actuate();
        println!("{}", report::render(&snapshot));

        let outcome = self
            .publisher
            .publish_if_due(&mut self.connectivity, &snapshot, Instant::now())
            .await;
        if let PublishOutcome::Failed(failure) = outcome {
            debug!("Dropped this report after {}", failure);
        }
        Ok(snapshot)
    }

    /// Bring up the links and run ticks until a restart is required.
    pub async fn run_loop(mut self) -> RestartRequired {
        if let Err(restart) = self.connectivity.ensure_network().await {
            return restart;
        }
        if let Err(restart) = self.connectivity.ensure_session().await {
            return restart;
        }

        let mut ticker = interval(self.loop_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(restart) = self.tick().await {
                return restart;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::tests::{MockBroker, MockNetwork, policy};
    use crate::hardware::SimBoard;
    use crate::messages::{NO_ECHO_CM, Occupancy};
    use crate::mqtt::SessionFailure;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
        [mqtt]
        host = "localhost"

        [sensing]
        threshold_cm = 50.0
        inter_sensor_delay_ms = 0

        [[spaces]]
        trigger = 5
        echo = 18
        green = 19
        red = 4

        [[spaces]]
        trigger = 21
        echo = 22
        green = 23
        red = 2

        [[spaces]]
        trigger = 32
        echo = 33
        green = 25
        red = 15

        [[spaces]]
        trigger = 26
        echo = 27
        green = 14
        red = 12
    "#;

    type TestManager = Manager<
        crate::hardware::SimOutput,
        crate::hardware::SimEcho,
        crate::hardware::StdDelay,
        MockNetwork,
        MockBroker,
    >;

    fn setup(broker: MockBroker) -> (TestManager, SimBoard) {
        let config = AppConfig::parse(CONFIG).unwrap();
        let mut board = SimBoard::new(
            0.01715,
            HashMap::from([(18, 10.0), (22, 60.0), (33, 0.0), (27, 45.0)]),
        );
        let connectivity = Connectivity::new(MockNetwork::up(), broker, policy(), "ESP32-24ac41");
        let publisher = Publisher::new(
            "ESP32-24ac41",
            "smartparking/status",
            Duration::from_millis(2_000),
        );
        let manager = Manager::new(&mut board, &config, connectivity, publisher).unwrap();
        (manager, board)
    }

    fn connected_broker() -> MockBroker {
        MockBroker {
            connect_results: [Ok(())].into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tick_end_to_end() {
        let (mut manager, board) = setup(connected_broker());
        let snapshot = manager.tick().await.unwrap();

        let occupancy: Vec<Occupancy> = snapshot.readings().iter().map(|r| r.occupancy).collect();
        assert_eq!(
            occupancy,
            vec![
                Occupancy::Occupied,
                Occupancy::Free,
                Occupancy::Free,
                Occupancy::Occupied
            ]
        );
        assert_eq!(snapshot.readings()[2].distance_cm, NO_ECHO_CM);
        assert!((snapshot.readings()[0].distance_cm - 10.0).abs() < 0.01);
        assert_eq!((snapshot.free(), snapshot.occupied()), (2, 2));
        assert_eq!(snapshot.availability(), 50);

        // red on for occupied spaces, green for free ones
        assert_eq!(board.level(4), Some(Level::High));
        assert_eq!(board.level(19), Some(Level::Low));
        assert_eq!(board.level(23), Some(Level::High));
        assert_eq!(board.level(2), Some(Level::Low));
        assert_eq!(board.level(25), Some(Level::High));
        assert_eq!(board.level(12), Some(Level::High));
        // trigger lines idle low after the pass
        assert_eq!(board.level(5), Some(Level::Low));

        let published = &manager.connectivity.broker_ref().published;
        assert_eq!(published.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        let flags: Vec<bool> = json["places"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["occupied"].as_bool().unwrap())
            .collect();
        assert_eq!(flags, vec![true, false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_without_broker_still_actuates() {
        let (mut manager, board) = setup(MockBroker::default());
        let snapshot = manager.tick().await.unwrap();
        assert_eq!(snapshot.occupied(), 2);
        assert_eq!(board.level(4), Some(Level::High));
        assert!(manager.connectivity.broker_ref().published.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_interval_counts_from_after_reconnect() {
        let broker = MockBroker {
            connect_results: [
                Err(SessionFailure::Unavailable),
                Err(SessionFailure::Unavailable),
                Err(SessionFailure::Unavailable),
                Err(SessionFailure::Unavailable),
                Ok(()),
            ]
            .into(),
            ..Default::default()
        };
        let (mut manager, _board) = setup(broker);
        let start = Instant::now();
        manager.tick().await.unwrap();
        // four retry gaps of 3 s before the session came up
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(manager.connectivity.broker_ref().published.len(), 1);

        // the next tick follows at once, well inside the publish interval
        manager.tick().await.unwrap();
        assert_eq!(manager.connectivity.broker_ref().published.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lamp_test_ends_dark() {
        let (mut manager, board) = setup(MockBroker::default());
        manager.lamp_test().await;
        for pin in [19, 4, 23, 2, 25, 15, 14, 12] {
            assert_eq!(board.level(pin), Some(Level::Low), "GPIO{}", pin);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_restarts_when_network_never_comes_up() {
        let (mut manager, _board) = setup(MockBroker::default());
        manager.connectivity = Connectivity::new(
            MockNetwork {
                up_after: None,
                polls: 0,
                begins: 0,
            },
            MockBroker::default(),
            policy(),
            "ESP32-24ac41",
        );
        let restart = manager.run_loop().await;
        assert_eq!(restart.attempts, 30);
    }
}
