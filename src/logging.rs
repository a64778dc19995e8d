//! Per-component logging to stderr in the form `[component] [SEVERITY]
//! message`, behind the `log` facade the library modules already use.
//!
//! Each component carries its own maximum severity, adjustable from the
//! command line: a bare number 0..=3 applies to everything, a
//! `component:severity` token to one component.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::sync::OnceLock;

/// Logging components, derived from the module emitting the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Component {
    /// The ingest core and everything not claimed below.
    Core = 0,
    /// The container prober.
    Probe = 1,
    /// The PSI decoding stack.
    Psi = 2,
    /// The SQLite store.
    Store = 3,
}

const COMPONENT_COUNT: usize = 4;

impl Component {
    fn name(self) -> &'static str {
        match self {
            Component::Core => "tsindex",
            Component::Probe => "probe",
            Component::Psi => "psi",
            Component::Store => "store",
        }
    }

    fn from_name(name: &str) -> Option<Component> {
        match name {
            "tsindex" => Some(Component::Core),
            "probe" => Some(Component::Probe),
            "psi" => Some(Component::Psi),
            "store" => Some(Component::Store),
            _ => None,
        }
    }

    /// Map a log target (module path) to its component.
    fn from_target(target: &str) -> Component {
        if target.contains("probe") {
            Component::Probe
        } else if target.contains("psi")
            || target.contains("demux")
            || target.contains("tables")
            || target.contains("framer")
        {
            Component::Psi
        } else if target.contains("store") {
            Component::Store
        } else {
            Component::Core
        }
    }
}

/// 0 = critical only .. 3 = debug.
fn severity_of(level: Level) -> u8 {
    match level {
        Level::Error => 0,
        Level::Warn => 1,
        Level::Info => 2,
        Level::Debug | Level::Trace => 3,
    }
}

fn severity_name(level: Level) -> &'static str {
    match level {
        Level::Error => "CRI",
        Level::Warn => "WRN",
        Level::Info => "INF",
        Level::Debug | Level::Trace => "DBG",
    }
}

/// Logger with one maximum severity per component.
pub struct ComponentLogger {
    max_severity: [u8; COMPONENT_COUNT],
}

impl Default for ComponentLogger {
    fn default() -> Self {
        Self {
            /* tsindex, probe, psi, store */
            max_severity: [2, 0, 2, 1],
        }
    }
}

impl ComponentLogger {
    /// Apply a verbosity spec: either one severity for everything or a
    /// comma-separated list of `component:severity` tokens. Unknown
    /// component names apply their severity across the board.
    pub fn apply_spec(&mut self, spec: &str) {
        for token in spec.split(',') {
            match token.split_once(':') {
                Some((name, severity)) => {
                    let severity = severity.trim().parse::<u8>().unwrap_or(0);
                    match Component::from_name(name.trim()) {
                        Some(component) => self.max_severity[component as usize] = severity,
                        None => self.max_severity = [severity; COMPONENT_COUNT],
                    }
                }
                None => {
                    let severity = token.trim().parse::<u8>().unwrap_or(0);
                    self.max_severity = [severity; COMPONENT_COUNT];
                }
            }
        }
    }

    fn wants(&self, component: Component, level: Level) -> bool {
        severity_of(level) <= self.max_severity[component as usize]
    }
}

impl Log for ComponentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.wants(Component::from_target(metadata.target()), metadata.level())
    }

    fn log(&self, record: &Record) {
        let component = Component::from_target(record.target());
        if self.wants(component, record.level()) {
            eprintln!(
                "[{}] [{}] {}",
                component.name(),
                severity_name(record.level()),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<ComponentLogger> = OnceLock::new();

/// Install the component logger, tuned by the `-v` spec when given.
pub fn init(spec: Option<&str>) -> Result<(), SetLoggerError> {
    let logger = LOGGER.get_or_init(|| {
        let mut logger = ComponentLogger::default();
        if let Some(spec) = spec {
            logger.apply_spec(spec);
        }
        logger
    });
    log::set_logger(logger)?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_severities_match_components() {
        let logger = ComponentLogger::default();
        assert!(logger.wants(Component::Core, Level::Info));
        assert!(!logger.wants(Component::Core, Level::Debug));
        assert!(!logger.wants(Component::Probe, Level::Warn));
        assert!(logger.wants(Component::Probe, Level::Error));
        assert!(!logger.wants(Component::Store, Level::Info));
        assert!(logger.wants(Component::Store, Level::Warn));
    }

    #[test]
    fn single_number_applies_everywhere() {
        let mut logger = ComponentLogger::default();
        logger.apply_spec("3");
        for component in [
            Component::Core,
            Component::Probe,
            Component::Psi,
            Component::Store,
        ] {
            assert!(logger.wants(component, Level::Debug));
        }
    }

    #[test]
    fn component_tokens_apply_selectively() {
        let mut logger = ComponentLogger::default();
        logger.apply_spec("psi:3,store:0");
        assert!(logger.wants(Component::Psi, Level::Debug));
        assert!(!logger.wants(Component::Store, Level::Warn));
        assert!(logger.wants(Component::Core, Level::Info));
    }

    #[test]
    fn unknown_component_hits_everything() {
        let mut logger = ComponentLogger::default();
        logger.apply_spec("nonsense:1");
        assert!(!logger.wants(Component::Core, Level::Info));
        assert!(logger.wants(Component::Core, Level::Warn));
    }

    #[test]
    fn targets_map_to_components() {
        assert_eq!(Component::from_target("tsindex::probe"), Component::Probe);
        assert_eq!(Component::from_target("tsindex::demux"), Component::Psi);
        assert_eq!(Component::from_target("tsindex::store"), Component::Store);
        assert_eq!(Component::from_target("tsindex::reader"), Component::Core);
    }
}
