use collar_tdma_lib::orchestrator::ReportOrchestrator;
use collar_tdma_lib::radio_devices::simulator::{
    RadioDevice, RadioInputMessage, RadioInputQueue, RadioInputQueueSender, RadioOutputMessage, RadioOutputQueue, RadioOutputQueueReceiver,
};
use collar_tdma_lib::sensors::heart_rate::SAMPLES_PER_READ;
use collar_tdma_lib::sensors::{
    ControlGate, GpsFix, GpsReceiver, GpsTask, HeartRateTask, PulseSensor, SensorControlChannel, SensorError, SensorKind, SensorLauncher,
    SensorSupervisor, SerialConfig, TemperatureProbe, TemperatureTask,
};
use collar_tdma_lib::{
    CollarConfiguration, CollarNode, CollarRadio, DeviceId, MemoryStore, PowerControl, RadioPacket, ReceivedPacket, SensorReport, SensorRequest,
    SharedTelemetry, SoftClock, StatusMask, SyncBroadcast,
};
use embassy_executor::Spawner;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use env_logger::Builder;
use log::{Level, LevelFilter, log};

const COLLAR_IDS: [DeviceId; COLLAR_COUNT] = [2, 5, 7];
const COLLAR_COUNT: usize = 3;
const ALLOC_TIME_S: u16 = 2;
const TIME_INTERVAL_S: u16 = 30;
const INTERVALS_TO_RUN: u32 = 3;
/// Rebroadcasts per interval, the last one reaching the collars' stability threshold
const SYNC_ROUNDS: u8 = 4;
const SYNC_ROUND_WINDOW: Duration = Duration::from_millis(600);
const REQUEST_RESEND_PERIOD: Duration = Duration::from_millis(700);
const POLL_PERIOD: Duration = Duration::from_millis(10);
const LOSS_PERCENT: u8 = 5;
/// Request id above every collar, carrying the final acknowledgements
const FLUSH_REQUEST_ID: u16 = 255;

/// Pulse front end with a fixed beat period
struct SimPulse {
    phase: u32,
    samples_per_beat: u32,
}

impl PulseSensor for SimPulse {
    async fn init(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read_raw(&mut self, ir: &mut [u32; SAMPLES_PER_READ]) -> Result<usize, SensorError> {
        for sample in ir.iter_mut() {
            self.phase = (self.phase + 1) % self.samples_per_beat;
            *sample = if self.phase == 0 { 62_000 } else { 50_000 };
        }
        Ok(SAMPLES_PER_READ)
    }

    fn detect_beat(&mut self, ir: u32) -> bool {
        ir > 60_000
    }
}

/// Slowly warming thermometer
struct SimThermometer {
    celsius: f32,
}

impl TemperatureProbe for SimThermometer {
    async fn init(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read(&mut self) -> Result<f32, SensorError> {
        self.celsius += 0.05;
        Ok(self.celsius)
    }
}

/// Emits one sentence per read and drifts north with every sentence
struct SimGps {
    latitude: f64,
    longitude: f64,
    last_sentence: Option<Instant>,
}

impl GpsReceiver for SimGps {
    async fn init(&mut self, _config: &SerialConfig) -> Result<(), SensorError> {
        Ok(())
    }

    async fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
        let sentence = b"$GPGGA,SIM*00\r\n";
        let count = sentence.len().min(buf.len());
        buf[..count].copy_from_slice(&sentence[..count]);
        Ok(count)
    }

    fn feed(&mut self, byte: u8) -> bool {
        if byte != b'\n' {
            return false;
        }
        self.latitude += 0.00001;
        self.last_sentence = Some(Instant::now());
        true
    }

    fn position(&self) -> Option<GpsFix> {
        self.last_sentence.map(|at| GpsFix {
            latitude: self.latitude,
            longitude: self.longitude,
            age: at.elapsed(),
        })
    }
}

#[embassy_executor::task(pool_size = COLLAR_COUNT)]
async fn heart_rate_task(task: HeartRateTask<SimPulse>, gate: ControlGate, telemetry: &'static SharedTelemetry, lock_timeout: Duration) -> ! {
    task.run(gate, telemetry, lock_timeout).await
}

#[embassy_executor::task(pool_size = COLLAR_COUNT)]
async fn temperature_task(
    task: TemperatureTask<SimThermometer>,
    gate: ControlGate,
    telemetry: &'static SharedTelemetry,
    lock_timeout: Duration,
) -> ! {
    task.run(gate, telemetry, lock_timeout).await
}

#[embassy_executor::task(pool_size = COLLAR_COUNT)]
async fn gps_task(task: GpsTask<SimGps>, gate: ControlGate, telemetry: &'static SharedTelemetry, lock_timeout: Duration) -> ! {
    task.run(gate, telemetry, lock_timeout).await
}

/// Spawns the simulated sensor tasks of one collar on first wake
struct SimLauncher {
    spawner: Spawner,
    device_id: DeviceId,
    gates: [Option<ControlGate>; 3],
    telemetry: &'static SharedTelemetry,
    lock_timeout: Duration,
}

impl SensorLauncher for SimLauncher {
    fn launch(&mut self, kind: SensorKind) -> Result<(), SensorError> {
        let slot = match kind {
            SensorKind::HeartRate => 0,
            SensorKind::Temperature => 1,
            SensorKind::Gps => 2,
        };
        let Some(gate) = self.gates[slot].take() else {
            return Err(SensorError::SpawnFailed);
        };
        let id = self.device_id;
        let spawned = match kind {
            SensorKind::HeartRate => {
                let sensor = SimPulse {
                    phase: 0,
                    samples_per_beat: 240 + id as u32 * 10,
                };
                self.spawner
                    .spawn(heart_rate_task(HeartRateTask::new(sensor, id), gate, self.telemetry, self.lock_timeout))
            }
            SensorKind::Temperature => {
                let probe = SimThermometer {
                    celsius: 37.5 + id as f32 * 0.1,
                };
                self.spawner
                    .spawn(temperature_task(TemperatureTask::new(probe, id), gate, self.telemetry, self.lock_timeout))
            }
            SensorKind::Gps => {
                let receiver = SimGps {
                    latitude: 47.49 + id as f64 * 0.001,
                    longitude: 19.04,
                    last_sentence: None,
                };
                self.spawner.spawn(gps_task(
                    GpsTask::new(receiver, SerialConfig::default(), id),
                    gate,
                    self.telemetry,
                    self.lock_timeout,
                ))
            }
        };
        spawned.map_err(|_| SensorError::SpawnFailed)
    }
}

/// Keeps the wake timer; a host process cannot power down
#[derive(Default)]
struct SimPower {
    wake_after: Duration,
}

impl PowerControl for SimPower {
    fn schedule_wake(&mut self, after: Duration) {
        self.wake_after = after;
    }

    fn enter_deep_sleep(&mut self) -> ! {
        loop {
            std::thread::park();
        }
    }
}

/// Boots, runs a cycle, sleeps, and boots again from the surviving parts
#[embassy_executor::task(pool_size = COLLAR_COUNT)]
async fn collar_task(config: CollarConfiguration, radio: CollarRadio, orchestrator: ReportOrchestrator<SimLauncher>) -> ! {
    let device_id = config.device_id;
    let mut power = SimPower::default();
    let mut parts = (radio, MemoryStore::new(), orchestrator, SoftClock::new());
    loop {
        let (radio, store, orchestrator, clock) = parts;
        let mut node = match CollarNode::boot(config.clone(), radio, store, orchestrator, clock) {
            Ok(node) => node,
            Err(err) => {
                log!(Level::Error, "[{}] Boot failed: {}, collar halted", device_id, err);
                loop {
                    Timer::after_secs(3600).await;
                }
            }
        };
        let plan = node.run_cycle().await;
        node.prepare_sleep(&plan, &mut power);
        parts = node.into_parts();

        Timer::after(power.wake_after).await;
        let missed = parts.0.discard_received();
        if missed > 0 {
            log!(Level::Debug, "[{}] {} packets arrived while asleep", device_id, missed);
        }
    }
}

/// Base station side of one collar's simulated radio
struct CollarLink {
    device_id: DeviceId,
    from_collar: RadioOutputQueueReceiver,
    to_collar: RadioInputQueueSender,
}

/// Scripted base station: sync rounds, then one request slot per synced collar
struct BaseStation {
    links: Vec<CollarLink>,
    synced: StatusMask,
    acked: StatusMask,
    reports: u32,
}

impl BaseStation {
    fn broadcast(&self, packet: &RadioPacket) {
        for link in &self.links {
            let message = RadioInputMessage::ReceivePacket(ReceivedPacket::new(packet.clone()));
            if link.to_collar.try_send(message).is_err() {
                log!(Level::Warn, "[base] Input queue of collar {} full", link.device_id);
            }
        }
    }

    /// Collects acks and reports until `deadline`, or until `reporter` has reported
    async fn listen_until(&mut self, deadline: Instant, reporter: Option<DeviceId>) -> bool {
        while Instant::now() < deadline {
            let mut heard_reporter = false;
            for i in 0..self.links.len() {
                while let Ok(RadioOutputMessage::SendPacket(packet)) = self.links[i].from_collar.try_receive() {
                    if let Some(id) = self.handle(&packet) {
                        heard_reporter |= Some(id) == reporter;
                    }
                }
            }
            if heard_reporter {
                return true;
            }
            Timer::after(POLL_PERIOD).await;
        }
        false
    }

    /// Returns the sender of a report
    fn handle(&mut self, packet: &RadioPacket) -> Option<DeviceId> {
        match packet.as_slice() {
            [0xAA, id] => {
                if !self.synced.is_set(*id) {
                    log!(Level::Info, "[base] Collar {} synced", id);
                }
                self.synced.set(*id);
                None
            }
            bytes @ [b'{', ..] => match SensorReport::decode(bytes) {
                Ok(report) => {
                    self.reports += 1;
                    log!(
                        Level::Info,
                        "[base] Report from {}: {:.2} C, {} bpm, ({:.5}, {:.5})",
                        report.device_id,
                        report.temperature,
                        report.heart_rate,
                        report.latitude,
                        report.longitude
                    );
                    self.acked.set(report.device_id);
                    Some(report.device_id)
                }
                Err(err) => {
                    log!(Level::Warn, "[base] Unreadable report: {}", err);
                    None
                }
            },
            other => {
                log!(Level::Debug, "[base] Ignoring {} byte packet", other.len());
                None
            }
        }
    }

    async fn run_interval(&mut self, number: u32) {
        let interval_start = Instant::now();
        self.synced = StatusMask::default();
        self.acked = StatusMask::default();
        log!(Level::Info, "[base] Interval {} starts", number);

        for retry_count in 0..SYNC_ROUNDS {
            let broadcast = SyncBroadcast {
                unix_time: unix_now(),
                alloc_time: ALLOC_TIME_S,
                time_interval: TIME_INTERVAL_S,
                retry_count,
                sync_status: self.synced.clone(),
            };
            self.broadcast(&broadcast.to_packet());
            self.listen_until(Instant::now() + SYNC_ROUND_WINDOW, None).await;
        }

        let synced: Vec<DeviceId> = COLLAR_IDS.iter().copied().filter(|&id| self.synced.is_set(id)).collect();
        log!(Level::Info, "[base] {} of {} collars synced", synced.len(), COLLAR_IDS.len());

        // Position p wakes p slots after the last broadcast
        let slots_start = Instant::now();
        let slot = Duration::from_secs(ALLOC_TIME_S as u64);
        for (index, &id) in synced.iter().enumerate() {
            let slot_start = slots_start + slot * (index as u32 + 1);
            let slot_end = slot_start + slot;
            Timer::at(slot_start).await;
            while Instant::now() < slot_end {
                let request = SensorRequest {
                    requested_id: id as u16,
                    ack_status: self.acked.clone(),
                };
                self.broadcast(&request.to_packet());
                let resend_at = (Instant::now() + REQUEST_RESEND_PERIOD).min(slot_end);
                if self.listen_until(resend_at, Some(id)).await {
                    break;
                }
            }
            if !self.acked.is_set(id) {
                log!(Level::Warn, "[base] No report from collar {}", id);
            }
        }

        let flush = SensorRequest {
            requested_id: FLUSH_REQUEST_ID,
            ack_status: self.acked.clone(),
        };
        self.broadcast(&flush.to_packet());
        self.listen_until(interval_start + Duration::from_secs(TIME_INTERVAL_S as u64), None).await;
    }
}

fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    Builder::new().filter_level(LevelFilter::Info).parse_default_env().init();

    let mut links = Vec::new();
    for id in COLLAR_IDS {
        let mut config = CollarConfiguration::with_defaults(id);
        config.acquisition_window_ms = 500;
        config.max_listen_secs = TIME_INTERVAL_S as u32;

        let output: &'static RadioOutputQueue = Box::leak(Box::new(Channel::new()));
        let input: &'static RadioInputQueue = Box::leak(Box::new(Channel::new()));
        let device = RadioDevice::with(output.sender(), input.receiver())
            .with_loss(LOSS_PERCENT)
            .with_seed(0x5EED_0000 + id as u64);
        let mut radio = CollarRadio::new(id);
        if let Err(err) = radio.initialize(spawner, device) {
            log!(Level::Error, "[{}] Radio init failed: {}", id, err);
            continue;
        }

        let controls: [&'static SensorControlChannel; 3] = [
            Box::leak(Box::new(Channel::new())),
            Box::leak(Box::new(Channel::new())),
            Box::leak(Box::new(Channel::new())),
        ];
        let telemetry: &'static SharedTelemetry = Box::leak(Box::new(SharedTelemetry::new()));
        let launcher = SimLauncher {
            spawner,
            device_id: id,
            gates: controls.map(|c| Some(ControlGate::new(c.receiver()))),
            telemetry,
            lock_timeout: config.telemetry_lock_timeout(),
        };
        let supervisor = SensorSupervisor::new(launcher, controls.map(|c| c.sender()), id);
        let orchestrator = ReportOrchestrator::new(&config, supervisor, telemetry);

        if let Err(err) = spawner.spawn(collar_task(config, radio, orchestrator)) {
            log!(Level::Error, "[{}] Collar task spawn failed: {:?}", id, err);
            continue;
        }
        links.push(CollarLink {
            device_id: id,
            from_collar: output.receiver(),
            to_collar: input.sender(),
        });
    }

    let mut base = BaseStation {
        links,
        synced: StatusMask::default(),
        acked: StatusMask::default(),
        reports: 0,
    };
    for number in 1..=INTERVALS_TO_RUN {
        base.run_interval(number).await;
    }
    log!(Level::Info, "[base] Done, {} reports over {} intervals", base.reports, INTERVALS_TO_RUN);
    std::process::exit(0);
}
