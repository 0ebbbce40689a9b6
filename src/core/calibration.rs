// src/core/calibration.rs

//! Deferred retrieval of calibration solutions.
//!
//! Sixty seconds after a recording starts, the worker connects to the
//! subarray's Telstate endpoint, combines the gain/bandpass/delay products
//! into per-input complex corrections, and stores the result in the shared
//! store under a timestamp-indexed key. The delay ensures the solutions
//! provided by Telstate are current for the track being recorded.

use crate::core::CoordinatorError;
use crate::core::client::{KeyValueStore, RedisClient};
use crate::core::context::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// How long after record-start the retrieval fires.
pub const CAL_RETRIEVAL_DELAY: Duration = Duration::from_secs(60);
/// The global average F-engine gain targeted for good quantisation.
pub const TARGET_AVERAGE_GAIN: f64 = 100.0;
/// Per-input relative gains outside this range are clipped.
const RELATIVE_GAIN_CLIP: (f64, f64) = (0.5, 2.0);

/// A complex F-engine gain. Stored interleaved (re, im) when packed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    /// `e^(i*phase)`.
    pub fn cis(phase: f64) -> Self {
        Self::new(phase.cos(), phase.sin())
    }

    pub fn abs(&self) -> f64 {
        self.re.hypot(self.im)
    }

    pub fn mul(&self, other: Complex) -> Complex {
        Complex::new(
            self.re * other.re - self.im * other.im,
            self.re * other.im + self.im * other.re,
        )
    }

    pub fn scale(&self, k: f64) -> Complex {
        Complex::new(self.re * k, self.im * k)
    }

    /// `1/z`; zero for a zero input rather than infinity.
    pub fn recip(&self) -> Complex {
        let norm = self.re * self.re + self.im * self.im;
        if norm == 0.0 {
            return Complex::default();
        }
        Complex::new(self.re / norm, -self.im / norm)
    }

    pub fn is_nan(&self) -> bool {
        self.re.is_nan() || self.im.is_nan()
    }
}

/// Calibration products for one phase-up, keyed by correlator input
/// (antenna + polarisation, e.g. `m000h`).
#[derive(Debug, Clone, Default)]
pub struct CalProducts {
    /// Complex gain per input (G).
    pub gains: BTreeMap<String, Complex>,
    /// Complex bandpass per channel per input (B, HV phase folded in).
    pub bp_gains: BTreeMap<String, Vec<Complex>>,
    /// Fixed delay in seconds per input (K, HV delay folded in).
    pub delays: BTreeMap<String, f64>,
    /// Sky frequency in Hz per bandpass channel.
    pub channel_freqs: Vec<f64>,
    pub refant: String,
    /// Unix time when the phase-up completed.
    pub phaseup_time: f64,
}

/// Source of calibration products. Abstracted so the combination math can be
/// exercised without a live Telstate endpoint.
#[async_trait]
pub trait CalSource: Send + Sync {
    /// Timestamp of the last successful phase-up, or 0.0 when none exists.
    async fn phaseup_time(&self) -> Result<f64>;
    async fn products(&self) -> Result<CalProducts>;
}

/// Reads the JSON mirror of the calibration products from the subarray's
/// Telstate endpoint (itself a key/value store).
pub struct TelstateSource {
    client: RedisClient,
}

impl TelstateSource {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: RedisClient::connect(endpoint).await?,
        })
    }

    async fn get_json(&self, key: &str) -> Result<Value> {
        let raw = self
            .client
            .get(key)
            .await?
            .ok_or_else(|| CoordinatorError::CalUnavailable(format!("missing key {key}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| CoordinatorError::CalUnavailable(format!("bad JSON under {key}: {e}")))
    }

    fn complex_from(value: &Value) -> Option<Complex> {
        let pair = value.as_array()?;
        Some(Complex::new(pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
    }

    fn complex_map(value: &Value) -> BTreeMap<String, Complex> {
        let mut map = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (input, v) in obj {
                if let Some(c) = Self::complex_from(v) {
                    map.insert(input.clone(), c);
                }
            }
        }
        map
    }

    fn complex_vec_map(value: &Value) -> BTreeMap<String, Vec<Complex>> {
        let mut map = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (input, v) in obj {
                if let Some(arr) = v.as_array() {
                    map.insert(
                        input.clone(),
                        arr.iter().filter_map(Self::complex_from).collect(),
                    );
                }
            }
        }
        map
    }

    fn float_map(value: &Value) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (input, v) in obj {
                if let Some(f) = v.as_f64() {
                    map.insert(input.clone(), f);
                }
            }
        }
        map
    }
}

#[async_trait]
impl CalSource for TelstateSource {
    async fn phaseup_time(&self) -> Result<f64> {
        match self.client.get("phaseup_time").await? {
            Some(t) => Ok(t.parse().unwrap_or(0.0)),
            None => Ok(0.0),
        }
    }

    async fn products(&self) -> Result<CalProducts> {
        let gains = Self::complex_map(&self.get_json("product_G").await?);
        let mut bp_gains = Self::complex_vec_map(&self.get_json("product_B").await?);
        let mut delays = Self::float_map(&self.get_json("product_K").await?);

        // Fold the HV delay into the usual delay and the HV phase into the
        // bandpass, as the downstream beamformer expects.
        if let Ok(hv_delays) = self.get_json("product_KCROSS_DIODE").await {
            for (input, hv) in Self::float_map(&hv_delays) {
                if let Some(delay) = delays.get_mut(&input) {
                    *delay += hv;
                }
            }
        }
        if let Ok(hv_gains) = self.get_json("product_BCROSS_DIODE").await {
            for (input, hv) in Self::complex_vec_map(&hv_gains) {
                if let Some(bp) = bp_gains.get_mut(&input) {
                    for (b, h) in bp.iter_mut().zip(hv) {
                        *b = b.mul(h);
                    }
                }
            }
        }

        let bandwidth = self
            .client
            .get("bandwidth")
            .await?
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| CoordinatorError::CalUnavailable("missing bandwidth".to_string()))?;
        let center_freq = self
            .client
            .get("center_freq")
            .await?
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| CoordinatorError::CalUnavailable("missing center_freq".to_string()))?;
        let n_chans = self
            .client
            .get("n_chans")
            .await?
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| CoordinatorError::CalUnavailable("missing n_chans".to_string()))?;
        let channel_freqs = channel_frequencies(center_freq, bandwidth, n_chans);

        let refant = self
            .client
            .get("refant")
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let phaseup_time = self.phaseup_time().await?;

        Ok(CalProducts {
            gains,
            bp_gains,
            delays,
            channel_freqs,
            refant,
            phaseup_time,
        })
    }
}

/// Sky frequencies (Hz) associated with the bandpass channels.
pub fn channel_frequencies(center_freq: f64, bandwidth: f64, n_chans: usize) -> Vec<f64> {
    (0..n_chans)
        .map(|i| center_freq + (i as f64 - n_chans as f64 / 2.0) * (bandwidth / n_chans as f64))
        .collect()
}

/// Parses a Telstate endpoint sensor value, which arrives as a Python tuple
/// repr, e.g. `('10.98.2.128', 31029)`.
pub fn parse_endpoint(value: &str) -> Result<String> {
    let inner = value.trim().trim_start_matches('(').trim_end_matches(')');
    let (ip, port) = inner
        .split_once(',')
        .ok_or_else(|| CoordinatorError::BadEndpoint(value.to_string()))?;
    let ip = ip.trim().trim_matches('\'').trim_matches('"');
    let port = port.trim();
    if ip.is_empty() || port.parse::<u16>().is_err() {
        return Err(CoordinatorError::BadEndpoint(value.to_string()));
    }
    Ok(format!("{ip}:{port}"))
}

/// Whether a retrieval should proceed: solutions must postdate the last
/// configuration and be newer than the last retrieved set.
pub fn should_retrieve(last_config_ts: f64, last_cal_ts: f64, current_cal_ts: f64) -> bool {
    if current_cal_ts < last_config_ts {
        return false;
    }
    last_cal_ts < current_cal_ts
}

/// Turns cal pipeline products into corrections to be passed to the
/// F-engines: `1 / (G × B × e^(-2πj·K·f))` per channel per input, with the
/// per-input average gain fixed relative to the global median and scaled to
/// the target average.
pub fn calculate_corrections(
    products: &CalProducts,
    target_average_correction: f64,
) -> Result<BTreeMap<String, Vec<Complex>>> {
    let mut average_gain: BTreeMap<String, f64> = BTreeMap::new();
    let mut corrections: BTreeMap<String, Vec<Complex>> = BTreeMap::new();

    // Relative corrections per input, with an arbitrary global average.
    for (input, g) in &products.gains {
        let delay = products.delays.get(input).copied().unwrap_or(0.0);
        let bandpass = products.bp_gains.get(input);
        let mut gains: Vec<Complex> = Vec::with_capacity(products.channel_freqs.len());
        for (chan, freq) in products.channel_freqs.iter().enumerate() {
            let k = Complex::cis(-2.0 * PI * delay * freq);
            let b = bandpass
                .and_then(|bp| bp.get(chan))
                .copied()
                .unwrap_or(Complex::new(1.0, 0.0));
            gains.push(k.mul(b).mul(*g));
        }
        if gains.iter().all(Complex::is_nan) {
            average_gain.insert(input.clone(), 0.0);
            corrections.insert(input.clone(), vec![Complex::default(); gains.len()]);
            continue;
        }
        let abs_gains: Vec<f64> = gains
            .iter()
            .map(Complex::abs)
            .filter(|a| !a.is_nan())
            .collect();
        average_gain.insert(input.clone(), median(&abs_gains));
        // Invalid gains become zero corrections.
        let corr: Vec<Complex> = gains
            .iter()
            .map(|g| {
                let c = g.recip();
                if c.is_nan() { Complex::default() } else { c }
            })
            .collect();
        corrections.insert(input.clone(), corr);
    }

    let valid_average_gains: Vec<f64> = average_gain.values().copied().filter(|g| *g > 0.0).collect();
    if valid_average_gains.is_empty() {
        return Err(CoordinatorError::CalUnavailable(
            "all gains invalid and beamformer output will be zero".to_string(),
        ));
    }
    let global_average_gain = median(&valid_average_gains);

    // Fix average values of the corrections so that an input at the global
    // average receives the target correction.
    for (input, corr) in corrections.iter_mut() {
        let relative_gain = average_gain[input] / global_average_gain;
        if relative_gain == 0.0 {
            warn!("{input} has no valid gains and will be zeroed");
            continue;
        }
        let mut factor = target_average_correction * global_average_gain;
        let safe_relative_gain = relative_gain.clamp(RELATIVE_GAIN_CLIP.0, RELATIVE_GAIN_CLIP.1);
        if relative_gain != safe_relative_gain {
            warn!(
                "{input}: average gain relative to global average = {relative_gain:5.2} out of range, clipped to {safe_relative_gain:.1}"
            );
            factor *= relative_gain / safe_relative_gain;
        }
        for c in corr.iter_mut() {
            *c = c.scale(factor);
        }
    }
    Ok(corrections)
}

/// The median of a set of values, interpolating between the two central
/// values for even counts.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("no NaNs in median input"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Packs per-input corrections into an interleaved little-endian byte blob,
/// inputs in sorted order.
pub fn pack_corrections(corrections: &BTreeMap<String, Vec<Complex>>) -> Bytes {
    let mut buf = Vec::new();
    for corr in corrections.values() {
        for c in corr {
            buf.extend_from_slice(&c.re.to_le_bytes());
            buf.extend_from_slice(&c.im.to_le_bytes());
        }
    }
    Bytes::from(buf)
}

/// Retrieves, formats and indexes calibration solutions for `array` from its
/// currently advertised Telstate endpoint.
pub async fn fetch_and_store(ctx: &Context, array: &str, source: &dyn CalSource) -> Result<bool> {
    // Check first whether solutions have been delivered since this subarray
    // was last configured, and whether they are newer than the last set we
    // retrieved. A set is always requested for the first recording of a
    // configuration because subscribe resets the marker.
    let last_config_ts = read_ts(&*ctx.store, &format!("{array}:last-config")).await;
    let last_cal_ts = read_ts(&*ctx.store, &format!("{array}:last-cal")).await;
    let current_cal_ts = source.phaseup_time().await?;
    if current_cal_ts < last_config_ts {
        warn!("Calibration solutions not yet available for {array}");
        return Ok(false);
    }
    if !should_retrieve(last_config_ts, last_cal_ts, current_cal_ts) {
        info!("No calibration solution updates");
        return Ok(false);
    }

    let products = source.products().await?;
    let corrections = calculate_corrections(&products, TARGET_AVERAGE_GAIN)?;

    let script_ts = format_cal_ts(products.phaseup_time);
    let retrieval_dt = Utc::now();
    let retrieval_ts = retrieval_dt.format("%Y%m%dT%H%M%SZ").to_string();

    let nants = ctx.resolver.nants(array).await.unwrap_or(0);
    let ant_list = ctx
        .store
        .lrange(&format!("{array}:antennas"), 0, -1)
        .await
        .unwrap_or_default();
    let nchans = products.channel_freqs.len();
    let inputs: Vec<String> = corrections.keys().cloned().collect();

    let hash_key = format!("{array}:cal_solutions:{script_ts}");
    info!("Saving current calibration data into the store: {hash_key}");
    let fields = vec![
        ("cal_all".to_string(), pack_corrections(&corrections)),
        (
            "nants".to_string(),
            Bytes::from(nants.to_string().into_bytes()),
        ),
        (
            "antenna_list".to_string(),
            Bytes::from(serde_json::to_string(&ant_list)?.into_bytes()),
        ),
        (
            "inputs".to_string(),
            Bytes::from(serde_json::to_string(&inputs)?.into_bytes()),
        ),
        (
            "nchan".to_string(),
            Bytes::from(nchans.to_string().into_bytes()),
        ),
        (
            "refant".to_string(),
            Bytes::from(products.refant.clone().into_bytes()),
        ),
        (
            "script_ts".to_string(),
            Bytes::from(script_ts.clone().into_bytes()),
        ),
        (
            "retrieval_ts".to_string(),
            Bytes::from(retrieval_ts.into_bytes()),
        ),
    ];
    ctx.store.hset_bytes(&hash_key, &fields).await?;

    // Sorted-set index, scored by retrieval time.
    let index_key = format!("{array}:cal_solutions:index");
    ctx.store
        .zadd(&index_key, retrieval_dt.timestamp() as f64, &hash_key)
        .await?;

    ctx.store
        .set(&format!("{array}:last-cal"), &current_cal_ts.to_string())
        .await?;
    info!("New calibration solutions retrieved for {array}");
    Ok(true)
}

/// Schedules the deferred retrieval for one recording. Fire-and-forget: any
/// failure is logged and abandoned.
pub fn spawn_deferred(ctx: Arc<Context>, array: String) {
    info!("Starting delay to retrieve cal solutions in background");
    tokio::spawn(async move {
        tokio::time::sleep(CAL_RETRIEVAL_DELAY).await;
        if let Err(e) = deferred_fetch(&ctx, &array).await {
            error!("Calibration retrieval for {array} failed: {e}");
        }
    });
}

async fn deferred_fetch(ctx: &Context, array: &str) -> Result<()> {
    // The endpoint arrives indirected: a sensor key naming the key that
    // holds the endpoint tuple.
    let endpoint_key = ctx
        .store
        .get(&format!("{array}:telstate_sensor"))
        .await?
        .ok_or_else(|| CoordinatorError::MissingKey(format!("{array}:telstate_sensor")))?;
    let endpoint_val = ctx
        .store
        .get(&endpoint_key)
        .await?
        .ok_or_else(|| CoordinatorError::MissingKey(endpoint_key.clone()))?;
    let endpoint = parse_endpoint(&endpoint_val)?;
    let source = TelstateSource::connect(&endpoint).await?;
    fetch_and_store(ctx, array, &source).await?;
    Ok(())
}

async fn read_ts(store: &dyn KeyValueStore, key: &str) -> f64 {
    match store.get(key).await {
        Ok(Some(v)) => v.parse().unwrap_or(0.0),
        _ => {
            warn!("No value set for {key}.");
            0.0
        }
    }
}

fn format_cal_ts(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
