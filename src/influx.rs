use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::error;

/// One point ready to be written: the tagged reading plus its running means.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
}

impl MetricRecord {
    /// Render as a single InfluxDB line-protocol line with a seconds timestamp.
    pub fn to_line(&self) -> Result<String> {
        if self.fields.is_empty() {
            bail!("Point has no fields");
        }

        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            )?;
        }

        let mut sep = ' ';
        for (key, value) in &self.fields {
            if !value.is_finite() {
                bail!("Field {} has unsupported value {}", key, value);
            }
            write!(line, "{}{}={}", sep, escape(key, &[',', '=', ' ']), value)?;
            sep = ',';
        }

        write!(line, " {}", self.timestamp.timestamp())?;
        Ok(line)
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Destination for finished records.
pub trait MetricsSink {
    fn write(&mut self, record: &MetricRecord) -> error::Result<()>;
}

/// InfluxDB 1.x HTTP `/write` endpoint.
pub struct InfluxSink {
    client: reqwest::blocking::Client,
    write_url: String,
    database: String,
}

impl InfluxSink {
    pub fn new(url: &str, database: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            write_url: format!("{}/write", url.trim_end_matches('/')),
            database: database.to_string(),
        })
    }

    fn send(&self, record: &MetricRecord) -> Result<()> {
        let line = record.to_line()?;
        debug!("Influx: {}", line);

        let response = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "s")])
            .body(line)
            .send()
            .with_context(|| format!("Failed to POST to {}", self.write_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("InfluxDB answered {}: {}", status, body.trim());
        }
        Ok(())
    }
}

impl MetricsSink for InfluxSink {
    fn write(&mut self, record: &MetricRecord) -> error::Result<()> {
        self.send(record).map_err(error::Error::sink_write)
    }
}
