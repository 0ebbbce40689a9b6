// src/core/metadata.rs

//! Resolves CAM sensor keys into the quantities the gateway and the record
//! sequencing need: centre frequency, channelisation, sync time, schedule
//! block, observing band and the PKTIDX clock conversion.

use crate::core::CoordinatorError;
use crate::core::client::KeyValueStore;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Stream selector keys into the `<array>:streams` sensor.
const STREAM_TYPE: &str = "cbf.antenna_channelised_voltage";
const FENG_TYPE: &str = "wide.antenna-channelised-voltage";

#[derive(Clone)]
pub struct MetadataResolver {
    store: Arc<dyn KeyValueStore>,
}

impl MetadataResolver {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn get_required(&self, key: &str) -> Result<String> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| CoordinatorError::MissingKey(key.to_string()))
    }

    /// Builds the full name of a CBF sensor according to the CAM convention.
    async fn cbf_sensor_key(&self, array: &str, sensor: &str) -> Result<String> {
        let cbf_name = self.get_required(&format!("{array}:cbf_name")).await?;
        let cbf_prefix = self.get_required(&format!("{array}:cbf_prefix")).await?;
        Ok(format!("{array}:{cbf_name}_{cbf_prefix}_{sensor}"))
    }

    /// Builds the full name of a stream sensor according to the CAM
    /// convention.
    async fn stream_sensor_key(&self, array: &str, sensor: &str) -> Result<String> {
        let arr_num = subarray_number(array);
        let cbf_prefix = self.get_required(&format!("{array}:cbf_prefix")).await?;
        Ok(format!(
            "{array}:subarray_{arr_num}_streams_{cbf_prefix}_{sensor}"
        ))
    }

    async fn cbf_sensor(&self, array: &str, sensor: &str) -> Result<String> {
        let key = self.cbf_sensor_key(array, sensor).await?;
        self.get_required(&key).await
    }

    /// Number of antennas in the subarray.
    pub async fn nants(&self, array: &str) -> Result<u64> {
        Ok(self.store.llen(&format!("{array}:antennas")).await?)
    }

    /// Total number of fine frequency channels (FENCHAN).
    pub async fn n_channels(&self, array: &str) -> Result<String> {
        self.get_required(&format!("{array}:n_channels")).await
    }

    /// Current sync time (UNIX seconds, SYNCTIME).
    pub async fn sync_time(&self, array: &str) -> Result<i64> {
        let raw = self.cbf_sensor(array, "sync_time").await?;
        Ok(raw.parse::<f64>()? as i64)
    }

    /// Centre frequency in MHz (FECENTER), formatted for the gateway.
    pub async fn centre_freq(&self, array: &str) -> Result<String> {
        let key = self
            .stream_sensor_key(array, "antenna_channelised_voltage_centre_frequency")
            .await?;
        let hz: f64 = self.get_required(&key).await?.parse()?;
        Ok(format!("{}", hz / 1e6))
    }

    /// Observing bandwidth in MHz.
    pub async fn bandwidth_mhz(&self, array: &str) -> Result<f64> {
        let raw = self.cbf_sensor(array, "bandwidth").await?;
        Ok(raw.parse::<f64>()? / 1e6)
    }

    /// Coarse channel bandwidth in MHz from the F-engines (CHAN_BW). Carries
    /// no sign information.
    pub async fn coarse_chan_bw(&self, array: &str, n_freq_chans: &str) -> Result<String> {
        let adc_sample_rate: f64 = self.cbf_sensor(array, "adc_sample_rate").await?.parse()?;
        let n_chans: f64 = n_freq_chans.parse()?;
        Ok(format!("{}", adc_sample_rate / 2.0 / n_chans / 1e6))
    }

    /// Number of channels per substream (HNCHAN).
    pub async fn hnchan(&self, array: &str) -> Result<String> {
        self.cbf_sensor(array, "antenna_channelised_voltage_n_chans_per_substream")
            .await
    }

    /// Number of spectra per heap (HNTIME).
    pub async fn hntime(&self, array: &str) -> Result<String> {
        self.cbf_sensor(array, "antenna_channelised_voltage_spectra_per_heap")
            .await
    }

    /// Number of ADC samples per heap (HCLOCKS).
    pub async fn samples_per_heap(&self, array: &str, spectra_per_heap: &str) -> Result<i64> {
        let adc_per_spectra: i64 = self
            .cbf_sensor(array, "antenna_channelised_voltage_n_samples_between_spectra")
            .await?
            .parse()?;
        Ok(adc_per_spectra * spectra_per_heap.parse::<i64>()?)
    }

    /// The raw SPEAD endpoint string for the F-engine streams.
    pub async fn stream_endpoints(&self, array: &str) -> Result<String> {
        let raw = self.get_required(&format!("{array}:streams")).await?;
        let normalized = normalize_python_dict(&raw);
        let parsed: Value = serde_json::from_str(&normalized)
            .map_err(|e| CoordinatorError::BadEndpoint(format!("{array}:streams: {e}")))?;
        parsed
            .get(STREAM_TYPE)
            .and_then(|v| v.get(FENG_TYPE))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CoordinatorError::BadEndpoint(format!("{array}:streams missing {FENG_TYPE}"))
            })
    }

    /// The current schedule block id in hyphenated form, e.g. `20221128-0003`.
    /// May return `Unknown_SB` when the upstream does not know the block.
    pub async fn sb_id(&self, array: &str) -> Result<String> {
        let sb_id_list = self
            .get_required(&format!("{array}:sched_observation_schedule_1"))
            .await?;
        let answer = sb_id_list.split(',').next().unwrap_or("").to_string();
        if answer == "Unknown_SB" {
            return Ok(answer);
        }
        let pattern = Regex::new(r"^[0-9]{8}-[0-9]{4}").expect("static regex");
        if !pattern.is_match(&answer) {
            return Err(CoordinatorError::BadScheduleBlock(sb_id_list));
        }
        Ok(answer)
    }

    /// The current observing band. The CAM sensor reports every s-band
    /// subband as plain `s`, so the subband is recovered from the centre
    /// frequency.
    pub async fn band(&self, array: &str) -> Result<String> {
        let arr_num = subarray_number(array);
        let band = self
            .get_required(&format!("{array}:subarray_{arr_num}_band"))
            .await?;
        if band != "s" {
            return Ok(band);
        }
        let center = self.centre_freq(array).await?;
        let subband = match center.as_str() {
            "3062.5" => "s4",
            "2843.75" => "s3",
            "2625" => "s2",
            "2406.25" => "s1",
            "2187.5" => "s0",
            _ => {
                error!("Could not retrieve s-band subband for {array} (centre {center})");
                return Ok(band);
            }
        };
        Ok(subband.to_string())
    }

    /// The proposal id of the observing script, if published.
    pub async fn proposal_id(&self, array: &str) -> Result<Option<String>> {
        let arr_num = subarray_number(array);
        let key = format!("{array}:subarray_{arr_num}_script_proposal_id");
        Ok(self
            .store
            .get(&key)
            .await?
            .map(|id| id.trim_matches('\'').to_string()))
    }

    /// Whether the current observation belongs to the primary-time proposal,
    /// for which data must be preserved.
    pub async fn is_primary_time(&self, array: &str, primary_proposal_id: &str) -> bool {
        match self.proposal_id(array).await {
            Ok(Some(id)) => {
                if id == primary_proposal_id {
                    info!("Primary proposal ID detected for {array}");
                    true
                } else {
                    false
                }
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Could not retrieve proposal ID for {array}: {e}");
                false
            }
        }
    }

    /// The current target description plus the timestamps needed for the
    /// staleness check: `(target, target_ts, last_track_end)`.
    pub async fn target(&self, array: &str) -> Result<(String, f64, f64)> {
        let target = self.get_required(&format!("{array}:target")).await?;
        let target_ts: f64 = self.get_required(&format!("{array}:last-target")).await?.parse()?;
        let last_track_end: f64 = self
            .get_required(&format!("{array}:last-track-end"))
            .await?
            .parse()?;
        Ok((target, target_ts, last_track_end))
    }

    /// Writes the lower-case timing keys consumed by `pktidx_to_timestamp`.
    pub async fn write_timing_keys(
        &self,
        array: &str,
        hclocks: i64,
        synctime: i64,
        fenchan: &str,
        chan_bw: &str,
    ) -> Result<()> {
        self.store
            .set(&format!("{array}:hclocks"), &hclocks.to_string())
            .await?;
        self.store
            .set(&format!("{array}:synctime"), &synctime.to_string())
            .await?;
        self.store.set(&format!("{array}:fenchan"), fenchan).await?;
        self.store.set(&format!("{array}:chan_bw"), chan_bw).await?;
        Ok(())
    }

    /// Converts a PKTIDX value into a floating point unix timestamp (UTC)
    /// using the subarray's timing keys. Monotone in `pktidx` for fixed sync
    /// parameters.
    pub async fn pktidx_to_timestamp(&self, array: &str, pktidx: i64) -> Result<f64> {
        if pktidx < 0 {
            return Err(CoordinatorError::Internal(format!(
                "cannot convert pktidx {pktidx} to a timestamp"
            )));
        }
        let hclocks: f64 = self.get_required(&format!("{array}:hclocks")).await?.parse()?;
        let synctime: f64 = self.get_required(&format!("{array}:synctime")).await?.parse()?;
        let fenchan: f64 = self.get_required(&format!("{array}:fenchan")).await?.parse()?;
        let chan_bw: f64 = self.get_required(&format!("{array}:chan_bw")).await?.parse()?;
        // Seconds since SYNCTIME: PKTIDX*HCLOCKS/(2e6*FENCHAN*ABS(CHAN_BW))
        Ok(synctime + pktidx as f64 * hclocks / (2e6 * fenchan * chan_bw.abs()))
    }
}

/// The trailing subarray number, used in several CAM sensor names.
fn subarray_number(array: &str) -> &str {
    array.rsplit('_').next().unwrap_or(array)
}

/// The streams sensor arrives as a Python dict repr with single quotes and
/// unicode string prefixes; normalize it into JSON.
fn normalize_python_dict(raw: &str) -> String {
    raw.replace("u'", "'").replace('\'', "\"")
}
