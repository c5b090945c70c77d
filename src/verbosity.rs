//! `MEMORY_TOOLS_VERBOSITY` parsing and the verbosity -> service-defaults table.

use once_cell::sync::OnceCell;

/// Controls the default state of a freshly-constructed
/// [`crate::service::MemoryToolsService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Suppress reports unless a callback explicitly asks for a backtrace.
    Quiet,
    /// Report every forbidden event, but don't print a backtrace for it.
    Debug,
    /// Report every forbidden event and always print a backtrace.
    Trace,
}

impl Verbosity {
    const ENV_VAR: &'static str = "MEMORY_TOOLS_VERBOSITY";

    fn from_env_value(value: &str) -> Verbosity {
        match value {
            "debug" => Verbosity::Debug,
            "trace" => Verbosity::Trace,
            "quiet" => Verbosity::Quiet,
            other => {
                log::debug!(
                    "unrecognized {}={other:?}, defaulting to quiet",
                    Self::ENV_VAR
                );
                Verbosity::Quiet
            }
        }
    }

    /// The `{ignored, should_print_backtrace}` defaults for this verbosity,
    /// per the table in the data model: quiet -> (true, false), debug ->
    /// (false, false), trace -> (false, true).
    pub const fn defaults(self) -> (bool, bool) {
        match self {
            Verbosity::Quiet => (true, false),
            Verbosity::Debug => (false, false),
            Verbosity::Trace => (false, true),
        }
    }
}

static VERBOSITY: OnceCell<Verbosity> = OnceCell::new();

/// The process's verbosity, read from the environment on first use and
/// cached for the remainder of the process lifetime.
pub fn current() -> Verbosity {
    *VERBOSITY.get_or_init(|| match std::env::var(Verbosity::ENV_VAR) {
        Ok(value) => Verbosity::from_env_value(&value),
        Err(_) => Verbosity::Quiet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_value_defaults_to_quiet() {
        assert_eq!(Verbosity::from_env_value("bogus"), Verbosity::Quiet);
    }

    #[test]
    fn defaults_table_matches_spec() {
        assert_eq!(Verbosity::Quiet.defaults(), (true, false));
        assert_eq!(Verbosity::Debug.defaults(), (false, false));
        assert_eq!(Verbosity::Trace.defaults(), (false, true));
    }
}
