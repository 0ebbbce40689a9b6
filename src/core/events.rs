// src/core/events.rs

//! The tagged event vocabulary understood by the per-subarray state machines,
//! and the parser for messages arriving on the coordination channels.

use crate::core::CoordinatorError;
use crate::core::instance::Instance;
use std::fmt;
use std::str::FromStr;

/// A canonical event for the Free/Subscribed and Rec/Proc state machines.
///
/// Channel verbs map onto these as: `configure` -> `Configure`,
/// `conf_complete` -> `Configured`, `tracking` -> `Record`,
/// `not-tracking` -> `TrackStop`, `deconfigure` -> `Deconfigure`,
/// `rec-timeout` -> `RecEnd`, `RETURN:<instance>:<c1>:<c2>` -> `Return`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Configure,
    Configured,
    Deconfigure,
    Record,
    TrackStop,
    RecEnd,
    /// An analyzer finished on one instance with its stage-1 and stage-2
    /// return codes. Stage 2 reports -1 when it did not run.
    Return {
        instance: Instance,
        stage1: i32,
        stage2: i32,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Configure => write!(f, "CONFIGURING"),
            Event::Configured => write!(f, "CONFIGURED"),
            Event::Deconfigure => write!(f, "DECONFIGURE"),
            Event::Record => write!(f, "RECORD"),
            Event::TrackStop => write!(f, "TRACK_STOP"),
            Event::RecEnd => write!(f, "REC_END"),
            Event::Return {
                instance,
                stage1,
                stage2,
            } => write!(f, "RETURN:{instance}:{stage1}:{stage2}"),
        }
    }
}

/// A parsed message from one of the coordination channels. `RETURN` messages
/// carry no subarray and are broadcast to every Rec/Proc machine; the machine
/// owning the instance consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub array: Option<String>,
    pub event: Event,
}

impl FromStr for ChannelMessage {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ':');
        let verb = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CoordinatorError::UnrecognisedMessage(s.to_string()))?;

        if verb == "RETURN" {
            // RETURN:<host>/<n>:<stage1>:<stage2>
            let rest = parts
                .next()
                .ok_or_else(|| CoordinatorError::UnrecognisedMessage(s.to_string()))?;
            let fields: Vec<&str> = rest.split(':').collect();
            if fields.len() != 3 {
                return Err(CoordinatorError::UnrecognisedMessage(s.to_string()));
            }
            let instance: Instance = fields[0].parse()?;
            let stage1 = fields[1]
                .parse::<i32>()
                .map_err(|_| CoordinatorError::UnrecognisedMessage(s.to_string()))?;
            let stage2 = fields[2]
                .parse::<i32>()
                .map_err(|_| CoordinatorError::UnrecognisedMessage(s.to_string()))?;
            return Ok(ChannelMessage {
                array: None,
                event: Event::Return {
                    instance,
                    stage1,
                    stage2,
                },
            });
        }

        let array = parts
            .next()
            .map(|rest| rest.split(':').next().unwrap_or(rest))
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CoordinatorError::UnrecognisedMessage(s.to_string()))?
            .to_string();

        let event = match verb {
            "configure" => Event::Configure,
            "conf_complete" => Event::Configured,
            "deconfigure" => Event::Deconfigure,
            "tracking" => Event::Record,
            "not-tracking" => Event::TrackStop,
            "rec-timeout" => Event::RecEnd,
            _ => return Err(CoordinatorError::UnrecognisedMessage(s.to_string())),
        };

        Ok(ChannelMessage {
            array: Some(array),
            event,
        })
    }
}
