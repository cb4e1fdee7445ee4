//! Modbus/TCP sensor lifecycle
//!
//! Holds the current [`DeviceConfig`] behind a read/write lock and hands a
//! snapshot of it to the gateway for every call. An optional monitor task
//! polls the device on an interval until it is cancelled.
//!
//! Lock order: `monitor` before `state`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ModelName, Registration, Sensor, SensorFactory, DESCRIPTION, PRETTY_NAME};
use crate::config::{DeviceConfig, ModbusSensorConfig};
use crate::error::{Result, WiseError};
use crate::protocols::modbus::{
    CommandStatus, DeviceGateway, SensorReadings, SessionConnector, TcpConnector,
};

pub fn model() -> ModelName {
    ModelName::new("advantech", "wise-4050", "modbus")
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configured,
    Closing,
    Closed,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    config: Arc<DeviceConfig>,
}

struct Inner<C: SessionConnector> {
    name: String,
    state: RwLock<State>,
    gateway: DeviceGateway<C>,
    latest: RwLock<Option<SensorReadings>>,
}

impl<C: SessionConnector> Inner<C> {
    /// Current config, unless the sensor is closing or closed
    async fn snapshot(&self) -> Result<Arc<DeviceConfig>> {
        let state = self.state.read().await;
        match state.phase {
            Phase::Configured => Ok(Arc::clone(&state.config)),
            Phase::Closing | Phase::Closed => Err(WiseError::closed(&self.name)),
        }
    }
}

struct Monitor {
    interval: Duration,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Cancel and wait for the task to exit
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Monitor task failed: {}", e);
        }
    }
}

async fn run_monitor<C: SessionConnector + 'static>(
    inner: Arc<Inner<C>>,
    interval: Duration,
    token: CancellationToken,
) {
    debug!("[{}] Monitor started, interval {:?}", inner.name, interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Ok(config) = inner.snapshot().await else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            result = inner.gateway.poll_all(&config) => match result {
                Ok(readings) => {
                    debug!("[{}] Monitor poll: {}", inner.name, readings.input_coils);
                    *inner.latest.write().await = Some(readings);
                },
                Err(e) => warn!("[{}] Monitor poll failed: {}", inner.name, e),
            }
        }
    }
    debug!("[{}] Monitor exited", inner.name);
}

/// WISE-4050 sensor speaking Modbus/TCP
pub struct ModbusSensor<C: SessionConnector = TcpConnector> {
    inner: Arc<Inner<C>>,
    monitor: Mutex<Option<Monitor>>,
}

impl ModbusSensor<TcpConnector> {
    /// Construct against the real device
    pub async fn new(name: &str, config: &ModbusSensorConfig) -> Result<Self> {
        Self::with_connector(name, config, TcpConnector).await
    }
}

impl<C: SessionConnector + 'static> ModbusSensor<C> {
    /// Validate `config`, store it and start the monitor if an interval is set
    pub async fn with_connector(name: &str, config: &ModbusSensorConfig, connector: C) -> Result<Self> {
        info!("Starting {} {}", PRETTY_NAME, name);
        let device = config.validate()?;
        let interval = device.poll_interval;

        let sensor = Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: RwLock::new(State {
                    phase: Phase::Configured,
                    config: Arc::new(device),
                }),
                gateway: DeviceGateway::new(connector),
                latest: RwLock::new(None),
            }),
            monitor: Mutex::new(None),
        };

        if let Some(interval) = interval {
            *sensor.monitor.lock().await = Some(sensor.spawn_monitor(interval));
        }
        Ok(sensor)
    }

    fn spawn_monitor(&self, interval: Duration) -> Monitor {
        let token = CancellationToken::new();
        let task = tokio::spawn(run_monitor(Arc::clone(&self.inner), interval, token.clone()));
        Monitor {
            interval,
            token,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn gateway(&self) -> &DeviceGateway<C> {
        &self.inner.gateway
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.read().await.phase
    }

    /// Snapshot of the active configuration
    pub async fn current_config(&self) -> Result<Arc<DeviceConfig>> {
        self.inner.snapshot().await
    }

    /// Whether a monitor task is running
    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Last successful monitor poll
    pub async fn latest_readings(&self) -> Option<SensorReadings> {
        self.inner.latest.read().await.clone()
    }

    /// Validate and swap in a new configuration
    ///
    /// On failure the previous configuration stays active. A changed poll
    /// interval restarts the monitor.
    pub async fn reconfigure(&self, config: &ModbusSensorConfig) -> Result<()> {
        let mut monitor = self.monitor.lock().await;

        let interval = {
            let mut state = self.inner.state.write().await;
            if state.phase != Phase::Configured {
                return Err(WiseError::closed(&self.inner.name));
            }
            let device = config.validate()?;
            debug!("Reconfiguring {} {}", PRETTY_NAME, self.inner.name);
            let interval = device.poll_interval;
            state.config = Arc::new(device);
            interval
        };

        let running = monitor.as_ref().map(|m| m.interval);
        if running != interval {
            if let Some(old) = monitor.take() {
                old.stop().await;
            }
            if let Some(interval) = interval {
                *monitor = Some(self.spawn_monitor(interval));
            }
        }
        Ok(())
    }

    /// Poll both coil blocks
    pub async fn read(&self) -> Result<SensorReadings> {
        let config = self.inner.snapshot().await?;
        self.inner.gateway.poll_all(&config).await
    }

    /// Apply a `coil<N>` command to the output block
    pub async fn write(&self, command: &Map<String, Value>) -> Result<CommandStatus> {
        let config = self.inner.snapshot().await?;
        self.inner.gateway.write_coils(&config, command).await
    }

    /// Mark closing, stop the monitor and wait for it to exit
    pub async fn close(&self) -> Result<()> {
        if !self.begin_close().await {
            return Ok(());
        }
        // Concurrent closers queue on the monitor lock until it has stopped
        let mut monitor = self.monitor.lock().await;
        if let Some(running) = monitor.take() {
            running.stop().await;
        }
        drop(monitor);
        self.finish_close().await;
        Ok(())
    }

    /// Like [`close`](Self::close) but gives up on the monitor after `limit`
    ///
    /// A monitor that does not exit in time is aborted and `Timeout` is
    /// returned; the sensor is closed either way.
    pub async fn close_with_timeout(&self, limit: Duration) -> Result<()> {
        if !self.begin_close().await {
            return Ok(());
        }
        let mut result = Ok(());
        let mut guard = self.monitor.lock().await;
        if let Some(monitor) = guard.take() {
            monitor.token.cancel();
            let abort = monitor.task.abort_handle();
            match tokio::time::timeout(limit, monitor.task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!("Monitor task failed: {}", e),
                Err(_) => {
                    warn!(
                        "[{}] Monitor did not exit within {:?}, aborting",
                        self.inner.name, limit
                    );
                    abort.abort();
                    result = Err(WiseError::timeout(
                        "monitor shutdown",
                        limit.as_millis() as u64,
                    ));
                },
            }
        }
        drop(guard);
        self.finish_close().await;
        result
    }

    /// Returns false if the sensor is already closed
    async fn begin_close(&self) -> bool {
        let mut state = self.inner.state.write().await;
        if state.phase == Phase::Closed {
            return false;
        }
        state.phase = Phase::Closing;
        true
    }

    async fn finish_close(&self) {
        let mut state = self.inner.state.write().await;
        if state.phase != Phase::Closed {
            state.phase = Phase::Closed;
            info!("Closed {} {}", PRETTY_NAME, self.inner.name);
        }
    }
}

#[async_trait]
impl<C: SessionConnector + 'static> Sensor for ModbusSensor<C> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn model(&self) -> ModelName {
        model()
    }

    async fn readings(&self) -> Result<Value> {
        Ok(self.read().await?.to_json())
    }

    async fn do_command(&self, command: &Map<String, Value>) -> Result<Value> {
        Ok(self.write(command).await?.to_json())
    }

    async fn reconfigure(&self, config: &Value) -> Result<()> {
        let config = ModbusSensorConfig::from_value(config)?;
        ModbusSensor::reconfigure(self, &config).await
    }

    async fn close(&self) -> Result<()> {
        ModbusSensor::close(self).await
    }
}

impl<C: SessionConnector> Drop for ModbusSensor<C> {
    fn drop(&mut self) {
        // a sensor dropped without close must not leave its monitor running
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.token.cancel();
        }
    }
}

struct ModbusSensorFactory;

#[async_trait]
impl SensorFactory for ModbusSensorFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Sensor>> {
        let config = ModbusSensorConfig::from_value(config)?;
        Ok(Box::new(ModbusSensor::new(name, &config).await?))
    }
}

pub fn registration() -> Registration {
    Registration {
        model: model(),
        pretty_name: PRETTY_NAME,
        description: DESCRIPTION,
        factory: Arc::new(ModbusSensorFactory),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::modbus::constants::coil_byte_count;
    use crate::protocols::modbus::ModbusSession;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records the config of every opened session; reads return all-ON coils
    #[derive(Clone, Default)]
    struct RecordingConnector {
        opened: Arc<StdMutex<Vec<(String, u16, u16)>>>,
        closes: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    struct RecordingSession {
        closes: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ModbusSession for RecordingSession {
        async fn read_coils(&mut self, _address: u16, quantity: u16) -> Result<Vec<u8>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(vec![0xFF; coil_byte_count(quantity as usize)])
        }

        async fn write_single_coil(&mut self, _address: u16, _on: bool) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl SessionConnector for RecordingConnector {
        type Session = RecordingSession;

        async fn open(&self, config: &DeviceConfig) -> Result<RecordingSession> {
            self.opened.lock().unwrap().push((
                config.host.clone(),
                config.digital_inputs.base_address,
                config.digital_outputs.base_address,
            ));
            Ok(RecordingSession {
                closes: Arc::clone(&self.closes),
                delay: self.delay,
            })
        }
    }

    fn raw_config(host: &str, di_base: u16, do_base: u16) -> ModbusSensorConfig {
        ModbusSensorConfig::from_value(&json!({
            "device_address": host,
            "port": "502",
            "digital_inputs": {"base_address": di_base, "length": 4},
            "digital_outputs": {"base_address": do_base, "length": 4}
        }))
        .unwrap()
    }

    async fn sensor(connector: RecordingConnector) -> ModbusSensor<RecordingConnector> {
        ModbusSensor::with_connector("wise", &raw_config("10.1.14.38", 0, 16), connector)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_construct_rejects_partial_config() {
        let mut config = raw_config("10.1.14.38", 0, 16);
        config.digital_outputs = None;
        let result =
            ModbusSensor::with_connector("wise", &config, RecordingConnector::default()).await;
        assert!(matches!(result.err().unwrap(), WiseError::Config(_)));
    }

    #[tokio::test]
    async fn test_readings_payload() {
        let sensor = sensor(RecordingConnector::default()).await;
        let payload = Sensor::readings(&sensor).await.unwrap();
        assert_eq!(payload["inputCoils"]["coil4"], json!(true));
        assert_eq!(payload["outputCoils"].as_object().unwrap().len(), 4);
        assert!(!sensor.is_monitoring().await);
        sensor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_old_config() {
        let sensor = sensor(RecordingConnector::default()).await;
        let mut bad = raw_config("10.1.14.99", 0, 16);
        bad.port = String::new();

        assert!(sensor.reconfigure(&bad).await.is_err());
        assert_eq!(sensor.current_config().await.unwrap().host, "10.1.14.38");

        sensor.reconfigure(&raw_config("10.1.14.99", 0, 16))
            .await
            .unwrap();
        assert_eq!(sensor.current_config().await.unwrap().host, "10.1.14.99");
        sensor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_readings_never_see_torn_config() {
        let connector = RecordingConnector {
            delay: Some(Duration::from_millis(2)),
            ..Default::default()
        };
        let sensor = Arc::new(sensor(connector.clone()).await);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let sensor = Arc::clone(&sensor);
            tasks.push(tokio::spawn(async move { sensor.read().await.unwrap() }));
        }
        sensor.reconfigure(&raw_config("10.1.14.99", 100, 200))
            .await
            .unwrap();
        for _ in 0..16 {
            let sensor = Arc::clone(&sensor);
            tasks.push(tokio::spawn(async move { sensor.read().await.unwrap() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let opened = connector.opened.lock().unwrap();
        assert_eq!(opened.len(), 32);
        for entry in opened.iter() {
            assert!(
                *entry == ("10.1.14.38".to_string(), 0, 16)
                    || *entry == ("10.1.14.99".to_string(), 100, 200),
                "torn config observed: {:?}",
                entry
            );
        }
        assert_eq!(connector.closes.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let sensor = sensor(RecordingConnector::default()).await;
        sensor.close().await.unwrap();
        sensor.close().await.unwrap();
        assert_eq!(sensor.phase().await, Phase::Closed);

        assert!(matches!(sensor.read().await, Err(WiseError::Closed(_))));
        assert!(matches!(
            sensor.write(&Map::new()).await,
            Err(WiseError::Closed(_))
        ));
        assert!(matches!(
            sensor.reconfigure(&raw_config("10.1.14.38", 0, 16)).await,
            Err(WiseError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_polls_and_close_joins_it() {
        let connector = RecordingConnector::default();
        let mut config = raw_config("10.1.14.38", 0, 16);
        config.poll_interval_ms = Some(10);
        let sensor = ModbusSensor::with_connector("wise", &config, connector.clone())
            .await
            .unwrap();
        assert!(sensor.is_monitoring().await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let latest = sensor.latest_readings().await.unwrap();
        assert_eq!(latest.input_coils.len(), 4);

        sensor.close().await.unwrap();
        assert!(!sensor.is_monitoring().await);

        let polls = connector.opened.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(connector.opened.lock().unwrap().len(), polls);
    }

    #[tokio::test]
    async fn test_reconfigure_restarts_monitor_on_interval_change() {
        let sensor = sensor(RecordingConnector::default()).await;
        assert!(!sensor.is_monitoring().await);

        let mut config = raw_config("10.1.14.38", 0, 16);
        config.poll_interval_ms = Some(1000);
        sensor.reconfigure(&config).await.unwrap();
        assert!(sensor.is_monitoring().await);

        config.poll_interval_ms = None;
        sensor.reconfigure(&config).await.unwrap();
        assert!(!sensor.is_monitoring().await);
        sensor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_in_flight_monitor_poll() {
        let connector = RecordingConnector {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut config = raw_config("10.1.14.38", 0, 16);
        config.poll_interval_ms = Some(5);
        let sensor = ModbusSensor::with_connector("wise", &config, connector)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), sensor.close())
            .await
            .expect("close should not wait for the stalled poll")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_with_timeout_reports_success() {
        let mut config = raw_config("10.1.14.38", 0, 16);
        config.poll_interval_ms = Some(10);
        let sensor = ModbusSensor::with_connector("wise", &config, RecordingConnector::default())
            .await
            .unwrap();

        sensor
            .close_with_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sensor.phase().await, Phase::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_close_with_running_monitor() {
        let connector = RecordingConnector::default();
        let mut config = raw_config("10.1.14.38", 0, 16);
        config.poll_interval_ms = Some(10);
        let sensor = ModbusSensor::with_connector("wise", &config, connector.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sensor.is_monitoring().await);

        let (first, second) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(sensor.close(), sensor.close())
        })
        .await
        .expect("concurrent close deadlocked");
        first.unwrap();
        second.unwrap();

        assert_eq!(sensor.phase().await, Phase::Closed);
        assert!(!sensor.is_monitoring().await);

        // neither closer returned while the monitor could still poll
        let polls = connector.opened.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(connector.opened.lock().unwrap().len(), polls);
    }
}
