//! Command-line and environment flags for [`LockingConfig`].
//!
//! Flags are spelled `--name=value`, `--name` (true) or `--no-name` (false);
//! dashes in names are folded to underscores. The same flags can be set from
//! the environment as `FASTLOCK_NAME=value`. The command line wins.

use std::{fmt, time::Duration};

use crate::config::{ConfigError, LockingConfig};

pub const ENV_PREFIX: &str = "FASTLOCK_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagType {
    Boolean,
    Usize,
    Millis,
    String,
}

pub struct FlagInfo {
    pub name: &'static str,
    pub comment: &'static str,
    pub typ: FlagType,
}

trait FlagValue: Sized {
    const TYPE: FlagType;

    fn parse(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    const TYPE: FlagType = FlagType::Boolean;

    fn parse(argument: &str) -> Option<Self> {
        match argument {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

fn parse_usize(argument: &str) -> Option<usize> {
    let (digits, radix) = if let Some(hex) = argument.strip_prefix("0x") {
        (hex, 16)
    } else if argument.len() > 1 && argument.starts_with('0') {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    };

    usize::from_str_radix(digits, radix).ok()
}

impl FlagValue for usize {
    const TYPE: FlagType = FlagType::Usize;

    fn parse(argument: &str) -> Option<Self> {
        parse_usize(argument)
    }
}

impl FlagValue for u32 {
    const TYPE: FlagType = FlagType::Usize;

    fn parse(argument: &str) -> Option<Self> {
        parse_usize(argument).and_then(|value| u32::try_from(value).ok())
    }
}

impl FlagValue for Duration {
    const TYPE: FlagType = FlagType::Millis;

    fn parse(argument: &str) -> Option<Self> {
        parse_usize(argument).map(|millis| Duration::from_millis(millis as u64))
    }
}

impl FlagValue for Option<String> {
    const TYPE: FlagType = FlagType::String;

    fn parse(argument: &str) -> Option<Self> {
        Some(Some(argument.to_owned()))
    }
}

macro_rules! define_locking_flags {
    ($($name:ident: $typ:ty, $comment:literal;)*) => {
        pub const FLAGS: &[FlagInfo] = &[
            $(FlagInfo {
                name: stringify!($name),
                comment: $comment,
                typ: <$typ as FlagValue>::TYPE,
            }),*
        ];

        /// `None` when there is no such flag, `Some(false)` when the value
        /// does not parse.
        fn set_flag_from_string(config: &mut LockingConfig, name: &str, argument: &str) -> Option<bool> {
            match name {
                $(stringify!($name) => Some(match <$typ as FlagValue>::parse(argument) {
                    Some(value) => {
                        config.$name = value;
                        true
                    }
                    None => false,
                }),)*
                _ => None,
            }
        }
    };
}

define_locking_flags! {
    use_fast_locking: bool, "Try the inline lock paths before calling the runtime (default: true)";
    use_biased_locking: bool, "Bias objects towards the first thread that locks them (default: true)";
    simple_fast_inflated_locking: bool, "Enter and exit inflated monitors inline when possible (default: true)";
    profile_monitors: bool, "Count how often each lock path is taken (default: false)";
    trace_monitors: Option<String>, "Trace lock events of classes whose name contains the value, empty for all";
    verify_balanced_monitors: bool, "Check that every thread exits exactly the monitors it entered (default: false)";
    bias_bulk_rebias_threshold: usize, "Revocations per class before all its biases are made stale (default: 20)";
    bias_bulk_revoke_threshold: usize, "Revocations per class before biasing is disabled for it (default: 40)";
    bias_decay_time: Duration, "Milliseconds after a bulk rebias that reset the revocation count (default: 25000)";
    monitor_spin_limit: u32, "Spins on a contended monitor before blocking (default: 64)";
    page_size: usize, "Page size used for the stack-lock recursion test (default: system page size)";
}

#[derive(Debug)]
pub enum FlagError {
    FlagNotFound(String),
    Config(ConfigError),
}

impl fmt::Display for FlagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagNotFound(name) => write!(f, "unknown flag: {name}"),
            Self::Config(error) => write!(f, "invalid locking configuration: {error}"),
        }
    }
}

impl std::error::Error for FlagError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(error) => Some(error),
            Self::FlagNotFound(_) => None,
        }
    }
}

impl From<ConfigError> for FlagError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

fn parse_option(config: &mut LockingConfig, option: &str) -> Result<(), FlagError> {
    const NO_1_PREFIX: &str = "no_";
    const NO_2_PREFIX: &str = "no-";

    let (name, argument) = match option.split_once('=') {
        Some((name, argument)) => (name, argument),
        None => match option
            .strip_prefix(NO_1_PREFIX)
            .or_else(|| option.strip_prefix(NO_2_PREFIX))
        {
            Some(name) if !name.is_empty() => (name, "false"),
            _ => (option, "true"),
        },
    };
    let name = name.replace('-', "_");

    match set_flag_from_string(config, &name, argument) {
        Some(true) => Ok(()),
        Some(false) => {
            log::warn!("Ignoring flag: {argument} is an invalid value for flag {name}");
            Ok(())
        }
        None => Err(FlagError::FlagNotFound(name)),
    }
}

fn apply_env(config: &mut LockingConfig, vars: impl IntoIterator<Item = (String, String)>) {
    for (var, argument) in vars {
        let Some(name) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let name = name.to_lowercase();

        match set_flag_from_string(config, &name, &argument) {
            Some(true) | None => {}
            Some(false) => {
                log::warn!("Ignoring {var}: {argument} is an invalid value for flag {name}")
            }
        }
    }
}

/// Builds a validated [`LockingConfig`] from defaults, then `env`, then
/// `args`. Arguments that do not start with `--` are skipped.
pub fn parse_locking_config(
    args: impl IntoIterator<Item = String>,
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<LockingConfig, FlagError> {
    let mut config = LockingConfig::default();
    apply_env(&mut config, env);

    for arg in args {
        if let Some(option) = arg.strip_prefix("--").filter(|option| !option.is_empty()) {
            parse_option(&mut config, option)?;
        }
    }

    config.validate()?;
    Ok(config)
}

impl LockingConfig {
    /// Configuration from the process' own arguments and environment.
    pub fn from_options() -> Result<Self, FlagError> {
        parse_locking_config(std::env::args().skip(1), std::env::vars())
    }
}

/// One line per flag, for `--help` output.
pub fn describe_flags() -> String {
    let width = FLAGS.iter().map(|flag| flag.name.len()).max().unwrap_or(0);
    FLAGS
        .iter()
        .map(|flag| {
            let value = match flag.typ {
                FlagType::Boolean => "",
                FlagType::Usize => "=<n>",
                FlagType::Millis => "=<ms>",
                FlagType::String => "=<text>",
            };
            format!(
                "  --{:<width$}  {}\n",
                format!("{}{}", flag.name, value),
                flag.comment,
                width = width + 7
            )
        })
        .collect()
}
