use chrono::Utc;
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::ReadErrorPolicy;
use crate::error::{Error, Result};
use crate::influx::{MetricRecord, MetricsSink};
use crate::meter::{Measurement, MeterSource};
use crate::window::SlidingWindow;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Means {
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
}

/// Static settings the collector needs on every tick.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub measurement: String,
    pub hostname: String,
    pub device_ip: String,
    pub window: usize,
    pub zero_fill: bool,
    pub on_read_error: ReadErrorPolicy,
}

/// What happened to the record built during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Disabled,
    Written,
    Failed,
}

/// Drives read → average → publish → log, one tick at a time.
pub struct Collector<S, K> {
    source: S,
    sink: Option<K>,
    settings: CollectorSettings,
    current: SlidingWindow,
    voltage: SlidingWindow,
    power: SlidingWindow,
}

impl<S: MeterSource, K: MetricsSink> Collector<S, K> {
    pub fn new(source: S, sink: Option<K>, settings: CollectorSettings) -> Self {
        let window = || {
            if settings.zero_fill {
                SlidingWindow::zero_filled(settings.window)
            } else {
                SlidingWindow::new(settings.window)
            }
        };
        let current = window();
        debug!(
            "Windows hold {} readings, {} prefilled",
            current.capacity(),
            current.len()
        );
        Self {
            current,
            voltage: window(),
            power: window(),
            source,
            sink,
            settings,
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> Option<&K> {
        self.sink.as_ref()
    }

    /// Push a reading into the windows and return the updated means.
    pub fn track(&mut self, m: &Measurement) -> Result<Means> {
        self.current.push(m.current);
        self.voltage.push(m.voltage);
        self.power.push(m.power);
        Ok(Means {
            current: self.current.mean()?,
            voltage: self.voltage.mean()?,
            power: self.power.mean()?,
        })
    }

    /// One full collection cycle. Read and statistics errors are returned;
    /// sink errors are logged and reported as `Publish::Failed`.
    pub fn tick(&mut self) -> Result<Publish> {
        let reading = self.source.read()?;
        let means = self.track(&reading)?;

        let published = match self.sink.as_mut() {
            Some(sink) => {
                let record = build_record(&self.settings, &reading, &means);
                match sink.write(&record) {
                    Ok(()) => Publish::Written,
                    Err(e) => {
                        warn!("Problem writing to InfluxDB server: {}", e);
                        Publish::Failed
                    }
                }
            }
            None => Publish::Disabled,
        };

        debug!(
            "Direct reading: {:?} Means: current: {} volts: {} power: {}",
            reading, means.current, means.voltage, means.power
        );
        Ok(published)
    }

    /// Run one tick and apply the read-error policy. An `Err` means the
    /// loop must stop.
    pub fn step(&mut self) -> Result<()> {
        match self.tick() {
            Ok(_) => Ok(()),
            Err(Error::DeviceRead(msg)) if self.settings.on_read_error == ReadErrorPolicy::Skip => {
                error!("Failed to read meter: {}", msg);
                Ok(())
            }
            Err(e) => {
                error!("Stopping collection: {}", e);
                Err(e)
            }
        }
    }

    /// Tick on `ticker` until `running` is cleared or a fatal error occurs.
    pub fn run(&mut self, ticker: &mut Ticker, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            ticker.wait();
            if !running.load(Ordering::SeqCst) {
                break;
            }
            self.step()?;
        }
        Ok(())
    }
}

/// Tags and fields for one tick's point, timestamped now.
pub fn build_record(settings: &CollectorSettings, m: &Measurement, means: &Means) -> MetricRecord {
    let mut tags = BTreeMap::new();
    tags.insert("host".to_string(), settings.hostname.clone());
    tags.insert("deviceip".to_string(), settings.device_ip.clone());

    let fields = [
        ("current", m.current),
        ("voltage", m.voltage),
        ("power", m.power),
        ("total", m.total_energy),
        ("cmean", means.current),
        ("vmean", means.voltage),
        ("pmean", means.power),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    MetricRecord {
        measurement: settings.measurement.clone(),
        timestamp: Utc::now(),
        tags,
        fields,
    }
}

/// Fixed-rate schedule: tick k fires at `start + k * interval`, regardless
/// of how long each tick took. Deadlines already in the past when a tick
/// finishes are dropped rather than fired back to back.
pub struct Ticker {
    interval: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(start: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next: start + interval,
        }
    }

    /// Block until the next deadline.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        }
        let skipped = self.advance(Instant::now());
        if skipped > 0 {
            debug!("Collection fell behind, skipped {} tick(s)", skipped);
        }
    }

    /// Move to the first deadline after `now`, returning how many
    /// deadlines were missed on the way.
    pub fn advance(&mut self, now: Instant) -> u32 {
        self.next += self.interval;
        let mut skipped = 0;
        while self.next <= now {
            self.next += self.interval;
            skipped += 1;
        }
        skipped
    }

    #[cfg(test)]
    pub fn next_deadline(&self) -> Instant {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeMeter {
        readings: VecDeque<Result<Measurement>>,
    }

    impl FakeMeter {
        fn new(readings: Vec<Result<Measurement>>) -> Self {
            Self {
                readings: readings.into(),
            }
        }
    }

    impl MeterSource for FakeMeter {
        fn read(&mut self) -> Result<Measurement> {
            self.readings
                .pop_front()
                .unwrap_or_else(|| Err(Error::DeviceRead("exhausted".to_string())))
        }
    }

    #[derive(Default)]
    struct FakeSink {
        written: Vec<MetricRecord>,
        fail: bool,
    }

    impl MetricsSink for FakeSink {
        fn write(&mut self, record: &MetricRecord) -> Result<()> {
            if self.fail {
                return Err(Error::SinkWrite("connection refused".to_string()));
            }
            self.written.push(record.clone());
            Ok(())
        }
    }

    fn settings(policy: ReadErrorPolicy, zero_fill: bool) -> CollectorSettings {
        CollectorSettings {
            measurement: "tplink-HS110".to_string(),
            hostname: "testhost".to_string(),
            device_ip: "192.168.1.1".to_string(),
            window: 300,
            zero_fill,
            on_read_error: policy,
        }
    }

    fn reading() -> Measurement {
        Measurement {
            current: 1.0,
            voltage: 120.0,
            power: 120.0,
            total_energy: 5.0,
        }
    }

    #[test]
    fn publishes_reading_and_means() {
        let mut c = Collector::new(
            FakeMeter::new(vec![Ok(reading())]),
            Some(FakeSink::default()),
            settings(ReadErrorPolicy::Skip, false),
        );

        assert_eq!(c.tick().unwrap(), Publish::Written);

        let written = &c.sink().unwrap().written;
        assert_eq!(written.len(), 1);
        let r = &written[0];
        assert_eq!(r.measurement, "tplink-HS110");
        assert_eq!(r.tags["host"], "testhost");
        assert_eq!(r.tags["deviceip"], "192.168.1.1");
        assert_eq!(r.fields["current"], 1.0);
        assert_eq!(r.fields["voltage"], 120.0);
        assert_eq!(r.fields["power"], 120.0);
        assert_eq!(r.fields["total"], 5.0);
        assert_eq!(r.fields["cmean"], 1.0);
        assert_eq!(r.fields["vmean"], 120.0);
        assert_eq!(r.fields["pmean"], 120.0);
        assert_eq!(r.fields.len(), 7);
    }

    #[test]
    fn zero_filled_means_are_diluted() {
        let mut c = Collector::new(
            FakeMeter::new(vec![Ok(reading())]),
            Some(FakeSink::default()),
            settings(ReadErrorPolicy::Skip, true),
        );
        c.tick().unwrap();

        let r = &c.sink().unwrap().written[0];
        assert_eq!(r.fields["current"], 1.0);
        assert!((r.fields["cmean"] - 1.0 / 300.0).abs() < 1e-12);
        assert!((r.fields["vmean"] - 120.0 / 300.0).abs() < 1e-12);
        assert!((r.fields["pmean"] - 120.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn means_track_recent_readings() {
        let mut c: Collector<FakeMeter, FakeSink> = Collector::new(
            FakeMeter::new(vec![]),
            None,
            CollectorSettings {
                window: 2,
                ..settings(ReadErrorPolicy::Skip, false)
            },
        );
        for power in [10.0, 20.0, 40.0] {
            let m = Measurement { power, ..reading() };
            c.track(&m).unwrap();
        }
        let means = c.track(&Measurement { power: 60.0, ..reading() }).unwrap();
        assert_eq!(means.power, 50.0);
        assert_eq!(means.current, 1.0);
    }

    #[test]
    fn no_sink_means_no_publish() {
        let mut c: Collector<FakeMeter, FakeSink> = Collector::new(
            FakeMeter::new(vec![Ok(reading()), Ok(reading())]),
            None,
            settings(ReadErrorPolicy::Fatal, false),
        );
        assert_eq!(c.tick().unwrap(), Publish::Disabled);
        assert!(c.step().is_ok());
        assert!(c.sink().is_none());
    }

    #[test]
    fn sink_failure_does_not_stop_the_loop() {
        let mut c = Collector::new(
            FakeMeter::new(vec![Ok(reading()), Ok(reading())]),
            Some(FakeSink {
                fail: true,
                ..FakeSink::default()
            }),
            settings(ReadErrorPolicy::Fatal, false),
        );
        assert_eq!(c.tick().unwrap(), Publish::Failed);
        assert!(c.step().is_ok());
    }

    #[test]
    fn skip_policy_continues_after_read_error() {
        let mut c = Collector::new(
            FakeMeter::new(vec![
                Err(Error::DeviceRead("timed out".to_string())),
                Ok(reading()),
            ]),
            Some(FakeSink::default()),
            settings(ReadErrorPolicy::Skip, false),
        );
        assert!(c.step().is_ok());
        assert!(c.sink().unwrap().written.is_empty());
        assert!(c.step().is_ok());
        assert_eq!(c.sink().unwrap().written.len(), 1);
    }

    #[test]
    fn fatal_policy_stops_on_read_error() {
        let mut c = Collector::new(
            FakeMeter::new(vec![Err(Error::DeviceRead("timed out".to_string()))]),
            Some(FakeSink::default()),
            settings(ReadErrorPolicy::Fatal, false),
        );
        assert!(matches!(c.step(), Err(Error::DeviceRead(_))));
        assert!(c.sink().unwrap().written.is_empty());
    }

    #[test]
    fn fatal_policy_ends_run() {
        let mut c = Collector::new(
            FakeMeter::new(vec![Ok(reading()), Err(Error::DeviceRead("gone".to_string()))]),
            Some(FakeSink::default()),
            settings(ReadErrorPolicy::Fatal, false),
        );
        let running = AtomicBool::new(true);
        let mut ticker = Ticker::new(Duration::from_millis(1));
        assert!(c.run(&mut ticker, &running).is_err());
        assert_eq!(c.sink().unwrap().written.len(), 1);
    }

    #[test]
    fn cleared_flag_ends_run() {
        let mut c: Collector<FakeMeter, FakeSink> = Collector::new(
            FakeMeter::new(vec![]),
            None,
            settings(ReadErrorPolicy::Fatal, false),
        );
        let running = AtomicBool::new(false);
        let mut ticker = Ticker::new(Duration::from_millis(1));
        assert!(c.run(&mut ticker, &running).is_ok());
    }

    #[test]
    fn ticker_is_fixed_rate() {
        let start = Instant::now();
        let second = Duration::from_secs(1);
        let mut t = Ticker::starting_at(start, second);
        assert_eq!(t.next_deadline(), start + second);

        // tick 1 handled promptly
        assert_eq!(t.advance(start + Duration::from_millis(1100)), 0);
        assert_eq!(t.next_deadline(), start + 2 * second);
    }

    #[test]
    fn ticker_coalesces_missed_deadlines() {
        let start = Instant::now();
        let second = Duration::from_secs(1);
        let mut t = Ticker::starting_at(start, second);

        // tick 1 finished 3.5s in: deadlines at 2s and 3s were missed
        assert_eq!(t.advance(start + Duration::from_millis(3500)), 2);
        assert_eq!(t.next_deadline(), start + 4 * second);
    }
}
