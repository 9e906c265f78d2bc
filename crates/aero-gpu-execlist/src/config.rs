use crate::csb::{CSB_MAX_ENTRIES, GEN8_CSB_ENTRIES};
use crate::error::ConfigError;
use crate::port::EXECLIST_MAX_PORTS;
use crate::request::ContextId;
use crate::ring::Ring;

/// Context id of the preempt-to-idle context. A `COMPLETE` status entry naming it means every
/// port has been switched out.
pub const PREEMPT_CONTEXT_ID: ContextId = 0x1FFF_FFFF;

pub const DEFAULT_RING_SIZE: u32 = 16 * 1024;

pub const DEFAULT_PREEMPT_TIMEOUT_NS: u64 = 100_000_000;

/// Engines per device; pending interrupts are tracked in a 64-bit mask.
pub const MAX_ENGINES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExeclistConfig {
    /// Number of submission ports the engine exposes.
    pub num_ports: usize,
    /// Size of the context status buffer (the read cursor wraps at this value).
    pub csb_entries: u8,
    /// Whether the engine may be preempted mid-request.
    pub preemption: bool,
    /// How long a preemption may go unacknowledged before the engine is declared hung.
    /// `None` disables the watchdog.
    pub preempt_timeout_ns: Option<u64>,
    pub preempt_context_id: ContextId,
    /// Bytes per context ring.
    pub ring_size: u32,
}

impl Default for ExeclistConfig {
    fn default() -> Self {
        Self {
            num_ports: EXECLIST_MAX_PORTS,
            csb_entries: GEN8_CSB_ENTRIES,
            preemption: true,
            preempt_timeout_ns: Some(DEFAULT_PREEMPT_TIMEOUT_NS),
            preempt_context_id: PREEMPT_CONTEXT_ID,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

impl ExeclistConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=EXECLIST_MAX_PORTS).contains(&self.num_ports) {
            return Err(ConfigError::BadPortCount {
                found: self.num_ports,
                max: EXECLIST_MAX_PORTS,
            });
        }
        if !(1..=CSB_MAX_ENTRIES).contains(&self.csb_entries) {
            return Err(ConfigError::BadCsbEntries {
                found: self.csb_entries,
                max: CSB_MAX_ENTRIES,
            });
        }
        Ring::new(self.ring_size)?;
        Ok(())
    }
}

/// Device configuration: one entry per engine, indexed by engine id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuConfig {
    pub engines: Vec<ExeclistConfig>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            engines: vec![ExeclistConfig::default()],
        }
    }
}

impl GpuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ENGINES).contains(&self.engines.len()) {
            return Err(ConfigError::BadEngineCount {
                found: self.engines.len(),
                max: MAX_ENGINES,
            });
        }
        self.engines.iter().try_for_each(ExeclistConfig::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RingError;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ExeclistConfig::default().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let cfg = ExeclistConfig {
            num_ports: 3,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadPortCount { found: 3, max: 2 })
        );

        let cfg = ExeclistConfig {
            csb_entries: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadCsbEntries { found: 0, .. })
        ));

        let cfg = ExeclistConfig {
            ring_size: 1000,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::BadRingSize(RingError::InvalidSize(1000)))
        );
    }

    #[test]
    fn gpu_config_checks_every_engine() {
        assert_eq!(GpuConfig::default().validate(), Ok(()));
        assert!(matches!(
            GpuConfig { engines: Vec::new() }.validate(),
            Err(ConfigError::BadEngineCount { found: 0, .. })
        ));

        let mut cfg = GpuConfig {
            engines: vec![ExeclistConfig::default(); 2],
        };
        cfg.engines[1].num_ports = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadPortCount { found: 0, .. })
        ));
    }
}
