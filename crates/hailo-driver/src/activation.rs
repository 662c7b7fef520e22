//! Network-group activation
//!
//! [`ResourcesManager::activate`] brings a configured group up and returns a
//! guard; dropping the guard, or [`ActivatedNetworkGroup::deactivate`], tears
//! it down:
//!
//! ```text
//! activate:   register fw channels ─▶ activate streams ─▶ open DDR ─▶ ENABLED
//! teardown:   abort streams ─▶ abort + close DDR ─▶ RESET
//!               ─▶ deactivate streams + unregister fw channels ─▶ clear aborts
//! ```

use crate::error::{Result, VdmaError};
use crate::resources::ResourcesManager;
use crate::stream::{InputStream, OutputStream};

/// An active network group; torn down on drop
#[derive(Debug)]
pub struct ActivatedNetworkGroup<'a> {
    manager: &'a mut ResourcesManager,
    inputs: Vec<InputStream>,
    outputs: Vec<OutputStream>,
    dynamic_batch_size: u16,
    active: bool,
}

impl ResourcesManager {
    /// Activate the group with the given boundary streams
    ///
    /// `dynamic_batch_size` 0 keeps the configured batch sizes. On failure
    /// whatever was brought up is torn down again.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` before [`configure`](Self::configure), or the
    /// first activation error.
    pub fn activate(
        &mut self,
        inputs: &[InputStream],
        outputs: &[OutputStream],
        dynamic_batch_size: u16,
    ) -> Result<ActivatedNetworkGroup<'_>> {
        if !self.is_configured() {
            return Err(VdmaError::invalid_operation("Network group must be configured before activation"));
        }
        tracing::info!(
            "Activating network group {} (batch {dynamic_batch_size})",
            self.metadata().network_group_name
        );

        let mut guard = ActivatedNetworkGroup {
            manager: self,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            dynamic_batch_size,
            active: true,
        };
        guard.bring_up()?;
        Ok(guard)
    }
}

impl ActivatedNetworkGroup<'_> {
    fn bring_up(&mut self) -> Result<()> {
        if self.dynamic_batch_size != 0 {
            self.manager
                .set_inter_context_channels_dynamic_batch_size(self.dynamic_batch_size)?;
        }
        self.manager.register_fw_managed_vdma_channels()?;
        for input in &self.inputs {
            input.activate_stream(self.dynamic_batch_size)?;
        }
        for output in &self.outputs {
            output.activate_stream(self.dynamic_batch_size)?;
        }
        self.manager.open_ddr_channels()?;
        self.manager.enable_state_machine(self.dynamic_batch_size)
    }

    /// Batch size the group was activated with; 0 for the configured one
    pub const fn dynamic_batch_size(&self) -> u16 {
        self.dynamic_batch_size
    }

    /// The underlying resources
    pub fn resources(&self) -> &ResourcesManager {
        self.manager
    }

    /// Input streams of the activation
    pub fn inputs(&self) -> &[InputStream] {
        &self.inputs
    }

    /// Output streams of the activation
    pub fn outputs(&self) -> &[OutputStream] {
        &self.outputs
    }

    /// Tear down, optionally keeping the nn core configuration
    ///
    /// # Errors
    ///
    /// The first teardown error; every step runs regardless.
    pub fn deactivate(mut self, keep_nn_config: bool) -> Result<()> {
        self.teardown(keep_nn_config)
    }

    fn teardown(&mut self, keep_nn_config: bool) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let mut result = Ok(());

        for input in &self.inputs {
            keep_first(&mut result, input.abort(), "abort input stream");
        }
        for output in &self.outputs {
            keep_first(&mut result, output.abort(), "abort output stream");
        }

        keep_first(&mut result, self.manager.abort_ddr_channels(), "abort DDR channels");
        self.manager.close_ddr_channels();

        keep_first(
            &mut result,
            self.manager.reset_state_machine(keep_nn_config),
            "reset state machine",
        );

        for input in &self.inputs {
            keep_first(&mut result, input.deactivate_stream(), "deactivate input stream");
        }
        for output in &self.outputs {
            keep_first(&mut result, output.deactivate_stream(), "deactivate output stream");
        }
        keep_first(
            &mut result,
            self.manager.unregister_fw_managed_vdma_channels(),
            "unregister fw channels",
        );

        for input in &self.inputs {
            keep_first(&mut result, input.clear_abort(), "clear input abort");
        }
        for output in &self.outputs {
            keep_first(&mut result, output.clear_abort(), "clear output abort");
        }

        tracing::info!("Deactivated network group {}", self.manager.metadata().network_group_name);
        result
    }
}

impl Drop for ActivatedNetworkGroup<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown(false) {
            tracing::error!("Failed to deactivate network group: {e}");
        }
    }
}

fn keep_first(result: &mut Result<()>, status: Result<()>, step: &str) {
    if let Err(e) = status {
        tracing::error!("Deactivation step '{step}' failed: {e}");
        if result.is_ok() {
            *result = Err(e);
        }
    }
}
