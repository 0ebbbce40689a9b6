// src/core/util.rs

//! Small helpers shared across entry actions.

use crate::core::CoordinatorError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::error;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// Converts RA from sexagesimal form (`h:m:s`) to degrees.
pub fn ra_degrees(ra_s: &str) -> Result<f64> {
    let parts: Vec<&str> = ra_s.split(':').collect();
    if parts.len() != 3 {
        return Err(CoordinatorError::BadTarget(format!("bad RA: {ra_s}")));
    }
    let h: i64 = parts[0].trim().parse()?;
    let m: i64 = parts[1].trim().parse()?;
    let s: f64 = parts[2].trim().parse()?;
    Ok(h as f64 * 15.0 + m as f64 * 0.25 + s * 15.0 / 3600.0)
}

/// Converts Dec from sexagesimal form (`d:m:s`) to degrees. The sign of the
/// degree field applies to the whole coordinate.
pub fn dec_degrees(dec_s: &str) -> Result<f64> {
    let parts: Vec<&str> = dec_s.split(':').collect();
    if parts.len() != 3 {
        return Err(CoordinatorError::BadTarget(format!("bad Dec: {dec_s}")));
    }
    let d_field = parts[0].trim();
    let d: i64 = d_field.parse()?;
    let m: i64 = parts[1].trim().parse()?;
    let s: f64 = parts[2].trim().parse()?;
    let dec = if d_field.starts_with('-') {
        d as f64 - m as f64 / 60.0 - s / 3600.0
    } else {
        d as f64 + m as f64 / 60.0 + s / 3600.0
    };
    Ok(dec)
}

/// Generic retry helper: re-invokes `attempt` until it succeeds, sleeping
/// `delay` between tries. Returns `None` when all attempts fail.
pub async fn retry<T, F, Fut>(retries: usize, delay: Duration, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for i in 0..retries {
        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) => {
                error!("Attempt {}/{} failed: {e}", i + 1, retries);
                if i + 1 < retries {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    error!("Unsuccessful after {retries} retries.");
    None
}

/// Logs and swallows an error from a best-effort operation.
pub fn log_error<T, E: Display>(context: &str, result: std::result::Result<T, E>) {
    if let Err(e) = result {
        error!("{context}: {e}");
    }
}
