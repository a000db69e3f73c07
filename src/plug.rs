use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error;
use crate::meter::{Measurement, MeterSource};

pub const DEFAULT_PORT: u16 = 9999;
/// Seed of the plug's autokey XOR cipher.
const INITIAL_KEY: u8 = 171;
const MAX_REPLY_LEN: usize = 64 * 1024;
const REALTIME_REQUEST: &str = r#"{"emeter":{"get_realtime":{}}}"#;

/// Client for a TP-Link HS110 style plug, speaking only the energy meter
/// request over its local TCP port.
pub struct Hs110 {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Hs110 {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        info!("Using plug at {}:{}", host, port);
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", self.host, self.port))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(e).with_context(|| format!("Failed to connect to {}:{}", self.host, self.port)),
            None => bail!("{}:{} resolved to no addresses", self.host, self.port),
        }
    }

    /// One request/reply exchange. The plug closes idle connections quickly,
    /// so every reading uses a fresh connection.
    fn fetch(&self) -> Result<Measurement> {
        let mut stream = self.connect()?;

        stream
            .write_all(&encrypt(REALTIME_REQUEST.as_bytes()))
            .context("Failed to send realtime request")?;

        let mut header = [0u8; 4];
        stream
            .read_exact(&mut header)
            .context("Failed to read reply length")?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_REPLY_LEN {
            bail!("Reply length {} exceeds {} bytes", len, MAX_REPLY_LEN);
        }

        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .context("Failed to read reply body")?;

        let plain = decrypt(&body);
        debug!("Plug: {}", String::from_utf8_lossy(&plain));
        parse_realtime(&plain)
    }
}

impl MeterSource for Hs110 {
    fn read(&mut self) -> error::Result<Measurement> {
        self.fetch().map_err(error::Error::device_read)
    }
}

/// Frame a payload: 4-byte big-endian length, then the obfuscated bytes.
pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + plain.len());
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    let mut key = INITIAL_KEY;
    for &b in plain {
        key ^= b;
        out.push(key);
    }
    out
}

/// Reverse the obfuscation of an unframed payload.
pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&c| {
            let p = key ^ c;
            key = c;
            p
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct Reply {
    emeter: Emeter,
}

#[derive(Debug, Deserialize)]
struct Emeter {
    get_realtime: Option<Realtime>,
    err_code: Option<i64>,
    err_msg: Option<String>,
}

/// Hardware v1 reports SI units, v2 reports milli-units and Wh.
#[derive(Debug, Deserialize)]
struct Realtime {
    #[serde(default)]
    err_code: i64,
    err_msg: Option<String>,
    current: Option<f64>,
    voltage: Option<f64>,
    power: Option<f64>,
    total: Option<f64>,
    current_ma: Option<f64>,
    voltage_mv: Option<f64>,
    power_mw: Option<f64>,
    total_wh: Option<f64>,
}

fn pick(si: Option<f64>, milli: Option<f64>, name: &str) -> Result<f64> {
    si.or(milli.map(|v| v / 1000.0))
        .ok_or_else(|| anyhow!("Reply is missing {}", name))
}

fn parse_realtime(raw: &[u8]) -> Result<Measurement> {
    let reply: Reply = serde_json::from_slice(raw).context("Failed to parse plug reply")?;

    if let Some(code) = reply.emeter.err_code.filter(|c| *c != 0) {
        bail!(
            "Plug rejected emeter request ({}): {}",
            code,
            reply.emeter.err_msg.unwrap_or_default()
        );
    }

    let rt = reply
        .emeter
        .get_realtime
        .ok_or_else(|| anyhow!("Reply has no get_realtime section"))?;

    if rt.err_code != 0 {
        bail!(
            "Plug reported error {}: {}",
            rt.err_code,
            rt.err_msg.unwrap_or_default()
        );
    }

    Ok(Measurement {
        current: pick(rt.current, rt.current_ma, "current")?,
        voltage: pick(rt.voltage, rt.voltage_mv, "voltage")?,
        power: pick(rt.power, rt.power_mw, "power")?,
        total_energy: pick(rt.total, rt.total_wh, "total")?,
    })
}
