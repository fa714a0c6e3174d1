//! System configuration.
//!
//! A [`SystemConfiguration`] is assembled with a [`SystemConfigurationBuilder`]
//! and validated once, before boot:
//!
//! ```
//! use keel::{Policy, SystemConfiguration};
//!
//! let config = SystemConfiguration::builder()
//!     .cpus(4)
//!     .preemptive(true)
//!     .policy(Policy::mlfq())
//!     .random_yield(42)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.cpus(), 4);
//! ```

use crate::{
    KernelError, MAX_CPU,
    thread::{
        policy::Policy,
        scheduler::{ENABLE_TICKS, MLFQ_LEVELS, TICK_INTERVAL},
    },
};
use bedrock::{MachineConfig, kprint::DebugFlags};

/// A validated system configuration.
#[derive(Clone, Debug)]
pub struct SystemConfiguration {
    cpus: usize,
    preemptive: bool,
    random_seed: Option<u64>,
    policy: Policy,
    time_limit: Option<u64>,
    debug: DebugFlags,
}

impl SystemConfiguration {
    /// Starts a configuration with the defaults: one CPU, no preemption,
    /// fixed timer interval, FIFO scheduling, no time limit, all debug
    /// categories enabled.
    pub fn builder() -> SystemConfigurationBuilder {
        SystemConfigurationBuilder::default()
    }

    /// Number of CPUs.
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Whether CPU timers run and preempt threads.
    pub fn preemptive(&self) -> bool {
        self.preemptive
    }

    /// Seed of the randomized timer intervals, if any.
    pub fn random_seed(&self) -> Option<u64> {
        self.random_seed
    }

    /// The scheduling policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Ticks after which the machine is halted, if any.
    pub fn time_limit(&self) -> Option<u64> {
        self.time_limit
    }

    /// Debug categories whose messages are emitted.
    pub fn debug(&self) -> DebugFlags {
        self.debug
    }

    pub(crate) fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            cpus: self.cpus,
            timer_interval: TICK_INTERVAL,
            enable_ticks: ENABLE_TICKS,
            random_seed: self.random_seed,
            time_limit: self.time_limit,
        }
    }
}

/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring the machine and the scheduler before boot.
#[derive(Clone, Debug)]
pub struct SystemConfigurationBuilder {
    cpus: usize,
    preemptive: bool,
    random_seed: Option<u64>,
    policy: Policy,
    time_limit: Option<u64>,
    debug: DebugFlags,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self {
            cpus: 1,
            preemptive: false,
            random_seed: None,
            policy: Policy::Fifo,
            time_limit: None,
            debug: DebugFlags::all(),
        }
    }
}

impl SystemConfigurationBuilder {
    /// Sets the number of CPUs, between 1 and [`MAX_CPU`].
    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// Enables the CPU timers, which drive preemption, timed sleep and
    /// MLFQ aging.
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    /// Randomizes the timer intervals with `seed`, and enables preemption.
    pub fn random_yield(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self.preemptive = true;
        self
    }

    /// Sets the scheduling policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Halts the machine once a CPU clock reaches `ticks`.
    pub fn time_limit(mut self, ticks: u64) -> Self {
        self.time_limit = Some(ticks);
        self
    }

    /// Sets the debug categories whose messages are emitted.
    pub fn debug(mut self, flags: DebugFlags) -> Self {
        self.debug = flags;
        self
    }

    /// Validates the configuration.
    pub fn build(self) -> Result<SystemConfiguration, KernelError> {
        if !(1..=MAX_CPU).contains(&self.cpus) {
            return Err(KernelError::InvalidConfiguration(format!(
                "cpu count must be between 1 and {MAX_CPU}, not {}",
                self.cpus
            )));
        }
        if let Policy::Mlfq {
            quantum,
            boost_period,
        } = self.policy
        {
            if quantum == 0 {
                return Err(KernelError::InvalidConfiguration(
                    "MLFQ quantum must be positive".into(),
                ));
            }
            // The bottom tier runs for `quantum << (MLFQ_LEVELS - 1)` ticks.
            let largest = u64::MAX >> (MLFQ_LEVELS - 1);
            if quantum > largest {
                return Err(KernelError::InvalidConfiguration(format!(
                    "MLFQ quantum must be at most {largest}, not {quantum}"
                )));
            }
            if boost_period == 0 {
                return Err(KernelError::InvalidConfiguration(
                    "MLFQ boost period must be positive".into(),
                ));
            }
        }
        Ok(SystemConfiguration {
            cpus: self.cpus,
            preemptive: self.preemptive,
            random_seed: self.random_seed,
            policy: self.policy,
            time_limit: self.time_limit,
            debug: self.debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_cpu_count() {
        for cpus in [0, MAX_CPU + 1] {
            assert!(matches!(
                SystemConfiguration::builder().cpus(cpus).build(),
                Err(KernelError::InvalidConfiguration(_))
            ));
        }
        assert!(SystemConfiguration::builder().cpus(MAX_CPU).build().is_ok());
    }

    #[test]
    fn rejects_empty_quantum() {
        let policy = Policy::Mlfq {
            quantum: 0,
            boost_period: 1_000,
        };
        assert!(matches!(
            SystemConfiguration::builder().policy(policy).build(),
            Err(KernelError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_overflowing_quantum() {
        let policy = |quantum| Policy::Mlfq {
            quantum,
            boost_period: 1_000,
        };
        let largest = u64::MAX >> (MLFQ_LEVELS - 1);
        assert!(matches!(
            SystemConfiguration::builder().policy(policy(1 << 62)).build(),
            Err(KernelError::InvalidConfiguration(_))
        ));
        let config = SystemConfiguration::builder()
            .policy(policy(largest))
            .build()
            .unwrap();
        assert_eq!(
            config.policy().quantum_for(MLFQ_LEVELS - 1),
            largest << (MLFQ_LEVELS - 1)
        );
    }

    #[test]
    fn random_yield_enables_preemption() {
        let config = SystemConfiguration::builder().random_yield(7).build().unwrap();
        assert!(config.preemptive());
        assert_eq!(config.random_seed(), Some(7));
        let machine = config.machine_config();
        assert_eq!(machine.timer_interval, TICK_INTERVAL);
        assert_eq!(machine.random_seed, Some(7));
    }
}
