//! Checker configuration.
//!
//! Values come from [`Config::default`], the environment ([`Config::from_env`])
//! or the command line, in increasing order of precedence.

use crate::Addr;
use crate::memory::{Zone, parse_addr};
use crate::table::{BLOCK_SIZE, INVALID_POINTER_ZONE};
use crate::violation::Violation;
use anyhow::{Context, Result, bail};
use tracing::error;

pub const STRICT_VAR: &str = "BCHECK_STRICT";
pub const HEAP_BASE_VAR: &str = "BCHECK_HEAP_BASE";
pub const HEAP_SIZE_VAR: &str = "BCHECK_HEAP_SIZE";
pub const RESERVE_VAR: &str = "BCHECK_RESERVE";

pub const DEFAULT_HEAP_BASE: Addr = 0x1000_0000;
pub const DEFAULT_HEAP_SIZE: u32 = 16 << 20;

/// What checks do with addresses whose block is untracked (EMPTY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UntrackedPolicy {
    /// Untracked memory passes every check.
    #[default]
    Permit,
    /// Untracked memory is treated like INVALID memory.
    Forbid,
}

/// How the fatal entry points report a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalAction {
    /// Print the diagnostic to stderr and exit with status 1.
    #[default]
    Exit,
    /// Panic with the diagnostic. Lets tests observe fatal paths.
    Panic,
}

impl FatalAction {
    pub fn raise(self, violation: Violation) -> ! {
        match self {
            FatalAction::Exit => {
                error!(%violation, "fatal bounds violation");
                eprintln!("bounds check: {violation}");
                std::process::exit(1)
            }
            FatalAction::Panic => panic!("bounds check: {violation}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub untracked: UntrackedPolicy,
    pub on_violation: FatalAction,
    /// First address of the heap zone. Must be block aligned.
    pub heap_base: Addr,
    pub heap_size: u32,
    /// Zones marked INVALID at bootstrap, besides the heap.
    pub reserved_zones: Vec<Zone>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            untracked: UntrackedPolicy::default(),
            on_violation: FatalAction::default(),
            heap_base: DEFAULT_HEAP_BASE,
            heap_size: DEFAULT_HEAP_SIZE,
            reserved_zones: Vec::new(),
        }
    }
}

impl Config {
    pub fn with_untracked(mut self, policy: UntrackedPolicy) -> Self {
        self.untracked = policy;
        self
    }

    pub fn with_fatal_action(mut self, action: FatalAction) -> Self {
        self.on_violation = action;
        self
    }

    pub fn with_heap(mut self, base: Addr, size: u32) -> Self {
        self.heap_base = base;
        self.heap_size = size;
        self
    }

    pub fn with_reserved_zone(mut self, zone: Zone) -> Self {
        self.reserved_zones.push(zone);
        self
    }

    pub fn heap_zone(&self) -> Zone {
        Zone::new(self.heap_base, self.heap_size)
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from `lookup`, which maps a variable name to
    /// its value. Unset variables keep their default.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(value) = lookup(STRICT_VAR) {
            config.untracked = if parse_flag(&value).with_context(|| format!("in {STRICT_VAR}"))? {
                UntrackedPolicy::Forbid
            } else {
                UntrackedPolicy::Permit
            };
        }
        if let Some(value) = lookup(HEAP_BASE_VAR) {
            config.heap_base = parse_addr(&value).with_context(|| format!("in {HEAP_BASE_VAR}"))?;
        }
        if let Some(value) = lookup(HEAP_SIZE_VAR) {
            config.heap_size = parse_addr(&value).with_context(|| format!("in {HEAP_SIZE_VAR}"))?;
        }
        if let Some(value) = lookup(RESERVE_VAR) {
            for zone in value.split(',').map(str::trim).filter(|zone| !zone.is_empty()) {
                let zone = zone.parse().with_context(|| format!("in {RESERVE_VAR}"))?;
                config.reserved_zones.push(zone);
            }
        }
        Ok(config)
    }

    /// Rejects heap placements the table cannot represent.
    pub fn validate(&self) -> Result<()> {
        let heap = self.heap_zone();
        if heap.size == 0 {
            bail!("heap size must not be zero");
        }
        if heap.start % BLOCK_SIZE != 0 {
            bail!("heap base 0x{:08x} is not aligned to {BLOCK_SIZE} bytes", heap.start);
        }
        if heap.end() > 1u64 << Addr::BITS {
            bail!("heap {heap} runs past the end of the address space");
        }
        if heap.overlaps(&INVALID_POINTER_ZONE) {
            bail!("heap {heap} overlaps the invalid pointer zone {INVALID_POINTER_ZONE}");
        }
        if let Some(zone) = self.reserved_zones.iter().find(|zone| zone.overlaps(&heap)) {
            bail!("reserved zone {zone} overlaps the heap {heap}");
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("`{other}` is not a boolean"),
    }
}
