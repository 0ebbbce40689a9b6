// src/core/fsm/freesub.rs

//! The Free/Subscribed machine: owns the subscription lifecycle of one
//! subarray (free -> configuring -> subscribed -> free).

use crate::core::context::Context;
use crate::core::events::Event;
use crate::core::fsm::SubarrayData;
use crate::core::{CoordinatorError, subscription, util};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FreeSubState {
    /// Not configured; no instances subscribed.
    Free,
    /// Awaiting the arrival of metadata.
    Configuring,
    /// DAQ instances are assigned and joined to their multicast groups.
    Subscribed,
}

pub struct FreeSubscribedMachine {
    array: String,
    ctx: Arc<Context>,
    state: FreeSubState,
}

impl FreeSubscribedMachine {
    pub fn new(array: &str, ctx: Arc<Context>) -> Self {
        Self::restore(array, ctx, FreeSubState::Free)
    }

    /// Reconstructs the machine in a saved state without running entry
    /// actions.
    pub fn restore(array: &str, ctx: Arc<Context>, state: FreeSubState) -> Self {
        Self {
            array: array.to_string(),
            ctx,
            state,
        }
    }

    pub fn state(&self) -> FreeSubState {
        self.state
    }

    pub async fn handle_event(&mut self, event: &Event, data: &mut SubarrayData) {
        info!(
            "{} in state {}, handling new event: {event}",
            self.array, self.state
        );
        let next = match (self.state, event) {
            (FreeSubState::Free, Event::Configure) => Some(FreeSubState::Configuring),
            (FreeSubState::Configuring, Event::Configured) => {
                if self.ctx.pool.is_empty() {
                    // No available instances: return to FREE.
                    self.ctx
                        .alerts
                        .alert(&format!(
                            ":no_entry_sign: `{}` no free instances, not configuring.",
                            self.array
                        ))
                        .await;
                    Some(FreeSubState::Free)
                } else {
                    Some(FreeSubState::Subscribed)
                }
            }
            (FreeSubState::Configuring, Event::Deconfigure) => Some(FreeSubState::Free),
            (FreeSubState::Subscribed, Event::Deconfigure) => Some(FreeSubState::Free),
            _ => None,
        };

        let Some(next) = next else {
            return;
        };
        if next == self.state {
            return;
        }
        // Run on_entry only when entering a new state; stay put if entry
        // fails.
        match self.enter(next, data).await {
            Ok(()) => self.state = next,
            Err(e) => warn!("Could not enter new state {next}: {e}"),
        }
    }

    async fn enter(&self, next: FreeSubState, data: &mut SubarrayData) -> Result<()> {
        info!("{} entering state: {next}", self.array);
        match next {
            FreeSubState::Free => self.enter_free(data).await,
            FreeSubState::Configuring => {
                self.ctx
                    .alerts
                    .alert(&format!(":magic_wand: `{}` configuring", self.array))
                    .await;
                Ok(())
            }
            FreeSubState::Subscribed => self.enter_subscribed(data).await,
        }
    }

    /// Deallocates instances from the subarray and instructs them to leave
    /// their multicast groups.
    async fn enter_free(&self, data: &mut SubarrayData) -> Result<()> {
        if data.subscribed.is_empty() {
            return Ok(());
        }
        // Unsubscription is best-effort: the instances are released to the
        // pool regardless so the fleet cannot leak.
        util::log_error(
            "unsubscribing instances",
            subscription::unsubscribe(&self.ctx, &self.array, &data.subscribed).await,
        );
        self.ctx.pool.release(std::mem::take(&mut data.subscribed));
        data.ready.clear();
        data.recording.clear();
        data.processing.clear();
        Ok(())
    }

    /// Allocates instances to a newly configured subarray and starts the
    /// subscription sequence.
    async fn enter_subscribed(&self, data: &mut SubarrayData) -> Result<()> {
        let n_requested = subscription::num_requested(&self.ctx, &self.array).await?;
        let claimed = self.ctx.pool.take(n_requested);
        data.subscribed.extend(claimed);
        if data.subscribed.len() < n_requested {
            self.ctx
                .alerts
                .alert(&format!(
                    ":warning: `{}` {}/{} available.",
                    self.array,
                    data.subscribed.len(),
                    n_requested
                ))
                .await;
        }
        data.ready = data.subscribed.clone();

        if let Err(e) = subscription::subscribe(&self.ctx, &self.array, &data.subscribed).await {
            // Roll the allocation back so a failed entry leaves the pool
            // intact.
            self.ctx.pool.release(std::mem::take(&mut data.subscribed));
            data.ready.clear();
            return Err(e);
        }
        Ok(())
    }
}
