// src/core/fsm/recproc.rs

//! The Rec/Proc machine: owns the recording and processing lifecycle of one
//! subarray (ready -> record -> process -> ready, with waiting and error
//! sinks for primary time and fatal analyzer results).

use crate::core::context::Context;
use crate::core::events::Event;
use crate::core::fsm::SubarrayData;
use crate::core::instance::Instance;
use crate::core::recording::{self, DEFAULT_DWELL, MIN_RECORDING_SECONDS};
use crate::core::{processing, util};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug)]
pub enum RecProcState {
    Ready,
    Record {
        primary_time: bool,
        /// Fallback rec-timeout timer; absent after a restart mid-recording.
        timer: Option<JoinHandle<()>>,
    },
    Process {
        stage1: Vec<i32>,
        stage2: Vec<i32>,
    },
    /// Primary-time hold: further transitions require an operator.
    Waiting,
    /// Fatal analyzer result: further transitions require an operator.
    Error,
}

impl RecProcState {
    pub fn name(&self) -> &'static str {
        match self {
            RecProcState::Ready => "READY",
            RecProcState::Record { .. } => "RECORD",
            RecProcState::Process { .. } => "PROCESS",
            RecProcState::Waiting => "WAITING",
            RecProcState::Error => "ERROR",
        }
    }

    /// Reconstructs a state from its persisted name, with no entry side
    /// effects. Run-time baggage (timers, accumulated return codes) does not
    /// survive a restart.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "READY" => Some(RecProcState::Ready),
            "RECORD" => Some(RecProcState::Record {
                primary_time: false,
                timer: None,
            }),
            "PROCESS" => Some(RecProcState::Process {
                stage1: Vec::new(),
                stage2: Vec::new(),
            }),
            "WAITING" => Some(RecProcState::Waiting),
            "ERROR" => Some(RecProcState::Error),
            _ => None,
        }
    }
}

pub struct RecProcMachine {
    array: String,
    ctx: Arc<Context>,
    state: RecProcState,
}

impl RecProcMachine {
    pub fn new(array: &str, ctx: Arc<Context>) -> Self {
        Self::restore(array, ctx, RecProcState::Ready)
    }

    pub fn restore(array: &str, ctx: Arc<Context>, state: RecProcState) -> Self {
        Self {
            array: array.to_string(),
            ctx,
            state,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub async fn handle_event(&mut self, event: &Event, data: &mut SubarrayData) {
        info!(
            "{} in state {}, handling new event: {event}",
            self.array,
            self.state.name()
        );
        // Take ownership of the current state; every arm hands back the next
        // one (often the same).
        let state = std::mem::replace(&mut self.state, RecProcState::Ready);
        self.state = match state {
            RecProcState::Ready => self.in_ready(event, data).await,
            RecProcState::Record {
                primary_time,
                timer,
            } => self.in_record(event, data, primary_time, timer).await,
            RecProcState::Process { stage1, stage2 } => {
                self.in_process(event, data, stage1, stage2).await
            }
            RecProcState::Waiting => {
                info!("In WAITING state, therefore ignoring: {event}");
                RecProcState::Waiting
            }
            RecProcState::Error => {
                info!("In ERROR state, therefore ignoring: {event}");
                RecProcState::Error
            }
        };
    }

    async fn in_ready(&self, event: &Event, data: &mut SubarrayData) -> RecProcState {
        if *event != Event::Record {
            return RecProcState::Ready;
        }
        if data.subscribed.is_empty() || !data.subscribed.is_subset(&data.ready) {
            warn!("Not all subscribed instances are ready.");
            return RecProcState::Ready;
        }
        info!("{} entering state: RECORD", self.array);
        match recording::record(&self.ctx, &self.array, &data.subscribed).await {
            Ok(result) => {
                data.ready = data.ready.difference(&result.instances).cloned().collect();
                data.recording = result.instances;
                RecProcState::Record {
                    primary_time: result.primary_time,
                    timer: Some(result.timer),
                }
            }
            Err(e) => {
                warn!("Could not start recording: {e}");
                RecProcState::Ready
            }
        }
    }

    async fn in_record(
        &self,
        event: &Event,
        data: &mut SubarrayData,
        primary_time: bool,
        timer: Option<JoinHandle<()>>,
    ) -> RecProcState {
        match event {
            Event::TrackStop => {
                info!("{} stopped tracking before DWELL complete", self.array);
                self.stop_recording(data, timer).await;
                self.after_recording(data, primary_time).await
            }
            Event::RecEnd => {
                self.ctx
                    .alerts
                    .alert(&format!(
                        ":black_square_for_stop: `{}` recording ended",
                        self.array
                    ))
                    .await;
                self.after_recording(data, primary_time).await
            }
            _ => RecProcState::Record {
                primary_time,
                timer,
            },
        }
    }

    /// An early stop: note the actual end time, cancel the fallback timer
    /// and re-arm DWELL so the DAQs are ready for the next track.
    async fn stop_recording(&self, data: &SubarrayData, timer: Option<JoinHandle<()>>) {
        let datadir = match self.ctx.store.get(&format!("{}:datadir", self.array)).await {
            Ok(Some(dir)) => dir,
            _ => {
                warn!("No datadir recorded for {}", self.array);
                String::new()
            }
        };
        // The stop time is wall clock, not derived from PKTIDX; use it
        // accordingly.
        if !datadir.is_empty() {
            util::log_error(
                "recording stop time",
                self.ctx
                    .store
                    .set(
                        &format!("rec_end:{datadir}"),
                        &format!("{}", Utc::now().timestamp() as f64),
                    )
                    .await,
            );
            if recording::too_short(&self.ctx, &datadir, MIN_RECORDING_SECONDS).await {
                self.ctx
                    .alerts
                    .alert(&format!(":timer_clock: `{datadir}` too short, ignoring"))
                    .await;
            }
        }
        match timer {
            Some(timer) => timer.abort(),
            None => {
                self.ctx
                    .alerts
                    .alert(&format!(
                        ":warning: `{}` no timer for `{datadir}`",
                        self.array
                    ))
                    .await;
            }
        }
        util::log_error(
            "resetting DWELL",
            self.ctx
                .gateway
                .reset_dwell(&data.recording, DEFAULT_DWELL)
                .await,
        );
        self.ctx
            .alerts
            .alert(&format!(
                ":black_square_for_stop: `{}` recording stopped",
                self.array
            ))
            .await;
    }

    /// Primary-time recordings hold for an operator; everything else flows
    /// into processing.
    async fn after_recording(&self, data: &mut SubarrayData, primary_time: bool) -> RecProcState {
        if primary_time {
            let released = std::mem::take(&mut data.recording);
            data.ready.extend(released);
            self.enter_waiting().await
        } else {
            self.enter_process(data).await
        }
    }

    async fn enter_waiting(&self) -> RecProcState {
        info!("{} entering state: WAITING", self.array);
        self.ctx
            .alerts
            .alert(&format!(
                ":bust_in_silhouette: `{}` intervention required",
                self.array
            ))
            .await;
        RecProcState::Waiting
    }

    async fn enter_error(&self) -> RecProcState {
        info!("{} entering state: ERROR", self.array);
        self.ctx
            .alerts
            .alert(&format!(":x: `{}` ERROR", self.array))
            .await;
        RecProcState::Error
    }

    /// Initiates processing on the appropriate instances.
    async fn enter_process(&self, data: &mut SubarrayData) -> RecProcState {
        info!("{} entering state: PROCESS", self.array);

        let released = std::mem::take(&mut data.recording);
        data.processing.extend(released);

        // Record what each instance actually wrote, for the analyzer's
        // mismatch check.
        processing::snapshot_last_datadirs(&self.ctx, &data.processing).await;

        // One analyzer process per host instance.
        processing::start_analyzers(&self.ctx, &data.processing).await;

        self.ctx
            .alerts
            .alert(&format!(":gear: `{}` processing", self.array))
            .await;

        let n = processing::get_n_proc(&*self.ctx.store).await.unwrap_or(0);
        if n % 10 == 0 {
            self.ctx
                .alerts
                .alert(&format!(
                    ":potable_water: `{}` will save beamformer output",
                    self.array
                ))
                .await;
            self.ctx
                .alerts
                .alert(&format!(":test_tube: `{}` running ML experiment", self.array))
                .await;
        }

        self.ctx
            .alerts
            .annotate("PROCESS", &format!("{}: processing", self.array))
            .await;

        RecProcState::Process {
            stage1: Vec::new(),
            stage2: Vec::new(),
        }
    }

    async fn in_process(
        &self,
        event: &Event,
        data: &mut SubarrayData,
        mut stage1: Vec<i32>,
        mut stage2: Vec<i32>,
    ) -> RecProcState {
        let Event::Return {
            instance,
            stage1: code1,
            stage2: code2,
        } = event
        else {
            return RecProcState::Process { stage1, stage2 };
        };

        if !data.processing.contains(instance) {
            // RETURNs are broadcast to every subarray; one not in our
            // processing set belongs to someone else (or no one).
            warn!("Unrecognised instance: {instance}");
            return RecProcState::Process { stage1, stage2 };
        }
        self.finish_instance(data, instance);
        stage1.push(*code1);
        stage2.push(*code2);

        if !data.processing.is_empty() {
            return RecProcState::Process { stage1, stage2 };
        }

        // All instances have reported; evaluate the aggregate result.
        let codes1 = processing::output_summary(&stage1);
        let codes2 = processing::output_summary(&stage2);
        let max1 = stage1.iter().max().copied().unwrap_or(0);
        let max2 = stage2.iter().max().copied().unwrap_or(-1);

        let stage2_msg = if max2 < 0 {
            None
        } else if max2 < 1 {
            Some(format!(
                ":white_check_mark: `{}` stage 2 complete: {codes2}",
                self.array
            ))
        } else if max2 < 2 {
            Some(format!(
                ":heavy_check_mark: `{}` stage 2 complete: {codes2}",
                self.array
            ))
        } else {
            Some(format!(":warning: `{}` stage 2 complete: {codes2}", self.array))
        };

        if max1 >= 2 {
            self.ctx
                .alerts
                .alert(&format!(":warning: `{}`: {codes1}", self.array))
                .await;
            return self.enter_error().await;
        }

        let mark = if max1 < 1 {
            ":white_check_mark:"
        } else {
            ":heavy_check_mark:"
        };
        self.ctx
            .alerts
            .alert(&format!("{mark} `{}` stage 1 complete: {codes1}", self.array))
            .await;
        if let Some(msg) = stage2_msg {
            self.ctx.alerts.alert(&msg).await;
        }
        util::log_error(
            "incrementing processing counter",
            processing::increment_n_proc(&*self.ctx.store).await,
        );
        info!("{} entering state: READY", self.array);
        RecProcState::Ready
    }

    fn finish_instance(&self, data: &mut SubarrayData, instance: &Instance) {
        data.processing.remove(instance);
        data.ready.insert(instance.clone());
    }
}
