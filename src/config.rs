//! Boot command-line configuration.
//!
//! The command line is a list of whitespace separated `key=value` words:
//!
//! | key         | value                                   | default |
//! |-------------|-----------------------------------------|---------|
//! | `loglevel`  | `off`, `error`, `warn`, `info`, `debug`, `trace` | `info` |
//! | `quantum`   | timer ticks per time slice, 1..=1000    | 5       |
//! | `hz`        | timer frequency, 19..=10000             | 100     |
//! | `debug`     | comma list of `pmm`, `paging`, `heap`, `sched` | none |
//! | `capture`   | `on` / `off`: keep log lines in memory  | `off`   |
//! | `heap`      | heap window as `<first>-<end>` tables   | 256-768 |
//!
//! Parsing runs before the heap exists, so rejected words are reported in a
//! fixed-size list.

use log::LevelFilter;

use crate::memory::bitmap::HeapWindow;
use crate::memory::{HEAP_END_TABLE, HEAP_FIRST_TABLE, TABLE_ENTRIES};

pub const DEFAULT_QUANTUM_TICKS: u32 = 5;
pub const DEFAULT_TIMER_HZ: u32 = 100;
pub const MAX_REJECTED: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown key")]
    UnknownKey,
    #[error("missing value")]
    MissingValue,
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
    #[error("{0} out of range")]
    OutOfRange(&'static str),
    #[error("unknown debug subsystem")]
    UnknownSubsystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub heap_window: HeapWindow,
    pub debug_pmm: bool,
    pub debug_heap: bool,
    pub debug_paging: bool,
}

impl MemoryConfig {
    pub const fn new() -> Self {
        Self {
            heap_window: HeapWindow::KERNEL,
            debug_pmm: false,
            debug_heap: false,
            debug_paging: false,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub quantum_ticks: u32,
    pub debug: bool,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            debug: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub capture: bool,
}

impl LogConfig {
    pub const fn new() -> Self {
        Self {
            level: LevelFilter::Info,
            capture: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
    pub timer_hz: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Words the parser refused, with the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedWords<'a> {
    words: [Option<(&'a str, ConfigError)>; MAX_REJECTED],
    dropped: usize,
}

impl<'a> RejectedWords<'a> {
    const fn new() -> Self {
        Self {
            words: [None; MAX_REJECTED],
            dropped: 0,
        }
    }

    fn push(&mut self, word: &'a str, err: ConfigError) {
        match self.words.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some((word, err)),
            None => self.dropped += 1,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, ConfigError)> + '_ {
        self.words.iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.iter().count() + self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejections beyond the fixed list capacity.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            memory: MemoryConfig::new(),
            scheduler: SchedulerConfig::new(),
            log: LogConfig::new(),
            timer_hz: DEFAULT_TIMER_HZ,
        }
    }

    /// Parses `cmdline`; rejected words keep their defaults.
    pub fn parse(cmdline: &str) -> (Self, RejectedWords<'_>) {
        let mut config = Self::new();
        let mut rejected = RejectedWords::new();
        for word in cmdline.split_ascii_whitespace() {
            if let Err(err) = config.apply(word) {
                rejected.push(word, err);
            }
        }
        (config, rejected)
    }

    fn apply(&mut self, word: &str) -> Result<(), ConfigError> {
        let (key, value) = word.split_once('=').ok_or(ConfigError::MissingValue)?;
        if value.is_empty() {
            return Err(ConfigError::MissingValue);
        }
        match key {
            "loglevel" => self.log.level = parse_level(value)?,
            "quantum" => {
                self.scheduler.quantum_ticks = parse_ranged(value, "quantum", 1, 1000)?;
            }
            "hz" => self.timer_hz = parse_ranged(value, "hz", 19, 10_000)?,
            "debug" => self.apply_debug(value)?,
            "capture" => {
                self.log.capture = match value {
                    "on" => true,
                    "off" => false,
                    _ => return Err(ConfigError::InvalidValue("capture")),
                }
            }
            "heap" => self.memory.heap_window = parse_window(value)?,
            _ => return Err(ConfigError::UnknownKey),
        }
        Ok(())
    }

    fn apply_debug(&mut self, list: &str) -> Result<(), ConfigError> {
        // Validate first so a bad entry leaves every toggle untouched.
        let mut toggles = [false; 4];
        for name in list.split(',') {
            let index = match name {
                "pmm" => 0,
                "paging" => 1,
                "heap" => 2,
                "sched" => 3,
                _ => return Err(ConfigError::UnknownSubsystem),
            };
            toggles[index] = true;
        }
        self.memory.debug_pmm |= toggles[0];
        self.memory.debug_paging |= toggles[1];
        self.memory.debug_heap |= toggles[2];
        self.scheduler.debug |= toggles[3];
        Ok(())
    }
}

fn parse_level(value: &str) -> Result<LevelFilter, ConfigError> {
    Ok(match value {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return Err(ConfigError::InvalidValue("loglevel")),
    })
}

fn parse_ranged(value: &str, key: &'static str, min: u32, max: u32) -> Result<u32, ConfigError> {
    let parsed: u32 = value.parse().map_err(|_| ConfigError::InvalidValue(key))?;
    if (min..=max).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(ConfigError::OutOfRange(key))
    }
}

fn parse_window(value: &str) -> Result<HeapWindow, ConfigError> {
    let (first, end) = value
        .split_once('-')
        .ok_or(ConfigError::InvalidValue("heap"))?;
    let first: usize = first.parse().map_err(|_| ConfigError::InvalidValue("heap"))?;
    let end: usize = end.parse().map_err(|_| ConfigError::InvalidValue("heap"))?;
    if first < HEAP_FIRST_TABLE || end > HEAP_END_TABLE || first >= end {
        return Err(ConfigError::OutOfRange("heap"));
    }
    Ok(HeapWindow::new(first * TABLE_ENTRIES, end * TABLE_ENTRIES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_line_gives_defaults() {
        let (config, rejected) = KernelConfig::parse("");
        assert_eq!(config, KernelConfig::new());
        assert_eq!(config.scheduler.quantum_ticks, 5);
        assert_eq!(config.timer_hz, 100);
        assert_eq!(config.log.level, LevelFilter::Info);
        assert!(rejected.is_empty());
    }

    #[test]
    fn default_matches_new() {
        let config = KernelConfig::default();
        assert_eq!(config, KernelConfig::new());
        assert_eq!(config.timer_hz, DEFAULT_TIMER_HZ);
    }

    #[test]
    fn known_keys_are_applied() {
        let (config, rejected) =
            KernelConfig::parse("loglevel=trace quantum=10 hz=250 debug=pmm,sched capture=on");
        assert!(rejected.is_empty());
        assert_eq!(config.log.level, LevelFilter::Trace);
        assert!(config.log.capture);
        assert_eq!(config.scheduler.quantum_ticks, 10);
        assert_eq!(config.timer_hz, 250);
        assert!(config.memory.debug_pmm);
        assert!(config.scheduler.debug);
        assert!(!config.memory.debug_heap);
    }

    #[test]
    fn bad_words_are_reported_and_ignored() {
        let (config, rejected) =
            KernelConfig::parse("quantum=0 loglevel=loud root=/dev/hda debug=pmm,fs quiet");
        assert_eq!(config.scheduler.quantum_ticks, DEFAULT_QUANTUM_TICKS);
        assert!(!config.memory.debug_pmm);

        let errors: [(&str, ConfigError); 5] = [
            ("quantum=0", ConfigError::OutOfRange("quantum")),
            ("loglevel=loud", ConfigError::InvalidValue("loglevel")),
            ("root=/dev/hda", ConfigError::UnknownKey),
            ("debug=pmm,fs", ConfigError::UnknownSubsystem),
            ("quiet", ConfigError::MissingValue),
        ];
        assert!(rejected.iter().eq(errors.iter().copied()));
    }

    #[test]
    fn heap_window_is_given_in_tables() {
        let (config, rejected) = KernelConfig::parse("heap=300-400");
        assert!(rejected.is_empty());
        assert_eq!(config.memory.heap_window, HeapWindow::new(300 * 1024, 400 * 1024));

        let (config, rejected) = KernelConfig::parse("heap=100-400");
        assert_eq!(rejected.len(), 1);
        assert_eq!(config.memory.heap_window, HeapWindow::KERNEL);
    }

    #[test]
    fn rejected_list_overflow_is_counted() {
        let (_, rejected) = KernelConfig::parse("a b c d e f g h i j");
        assert_eq!(rejected.len(), 10);
        assert_eq!(rejected.dropped(), 2);
    }
}
