use super::codec::WireValue;
use crate::config::{AdConfig, ToolFlavor};
use crate::tape::{AReal, AdTape, ExternalFunction, TapeIndex};
use tracing::debug;

/// The flavor-dependent part of the adapter: how received values join the
/// tape and when a communication needs a handle at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdTool {
    config: AdConfig,
}

impl AdTool {
    pub fn new(config: AdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdConfig {
        &self.config
    }

    pub fn flavor(&self) -> ToolFlavor {
        self.config.flavor
    }

    /// A handle is recorded only while the tape records, and only when some
    /// contribution is active (unless passive recording is switched on).
    pub fn is_handle_required(&self, tape: &dyn AdTape, any_active: bool) -> bool {
        tape.is_recording() && (any_active || self.config.record_passive)
    }

    /// Writes a received value into `target`.
    ///
    /// Active wire values get a fresh index on a recording tape; everything
    /// else arrives passive. Returns the primal previously stored at the new
    /// index (always `0.0` for the plain flavor).
    pub fn decode_into(&self, tape: &mut dyn AdTape, wire: &WireValue, target: &mut AReal) -> f64 {
        target.value = wire.primal;
        if !(wire.index.is_active() && tape.is_recording()) {
            target.index = TapeIndex::PASSIVE;
            return 0.0;
        }
        match self.config.flavor {
            ToolFlavor::Plain => {
                tape.register_input(target);
                0.0
            }
            ToolFlavor::PrimalRestore => tape.register_output(target).1,
        }
    }

    /// Hands `handle` to the tape.
    pub fn add_tool_action(&self, tape: &mut dyn AdTape, handle: Box<dyn ExternalFunction>) {
        debug!(handle = handle.name(), flavor = %self.config.flavor, "arming communication handle");
        tape.push_external_function(handle);
    }
}
