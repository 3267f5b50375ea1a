//! Driver configuration, parsed from `key=value` arguments.

use std::str::FromStr;

use thiserror::Error;

/// What a single exploration run looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploreConfig {
    /// Worker threads. Every one of them registers with the collector.
    pub threads: usize,
    /// Slots in the object pool.
    pub capacity: usize,
    /// Variables per worker; each holds at most one reference.
    pub vars: usize,
    /// Actions each worker performs.
    pub steps: usize,
    pub seed: u64,
    /// Relative weight of "request a collection cycle" against the other
    /// actions, which weigh 90 together.
    pub cycle_weight: u32,
}

impl Default for ExploreConfig {
    fn default() -> ExploreConfig {
        ExploreConfig {
            threads: 4,
            capacity: 32,
            vars: 4,
            steps: 10_000,
            seed: 0x5eed,
            cycle_weight: 5,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExploreConfigError {
    #[error("expected key=value, got {:?}", .0)]
    NotAPair(String),
    #[error("unknown setting {:?}", .0)]
    UnknownKey(String),
    #[error("{} wants a number, got {:?}", .key, .value)]
    BadNumber { key: String, value: String },
    #[error("{} must be at least 1", .0)]
    Zero(&'static str),
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, ExploreConfigError> {
    value.parse().map_err(|_| ExploreConfigError::BadNumber {
        key: key.into(),
        value: value.into(),
    })
}

impl ExploreConfig {
    /// Start from the defaults and apply each `key=value` in order.
    pub fn from_args<I, S>(args: I) -> Result<ExploreConfig, ExploreConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = ExploreConfig::default();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = match arg.find('=') {
                Some(ix) => (arg[..ix].trim(), arg[ix + 1..].trim()),
                None => return Err(ExploreConfigError::NotAPair(arg.into())),
            };
            match key {
                "threads" => config.threads = number(key, value)?,
                "capacity" => config.capacity = number(key, value)?,
                "vars" => config.vars = number(key, value)?,
                "steps" => config.steps = number(key, value)?,
                "seed" => config.seed = number(key, value)?,
                "cycle_weight" => config.cycle_weight = number(key, value)?,
                _ => return Err(ExploreConfigError::UnknownKey(key.into())),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExploreConfigError> {
        if self.threads == 0 {
            return Err(ExploreConfigError::Zero("threads"));
        }
        if self.capacity == 0 {
            return Err(ExploreConfigError::Zero("capacity"));
        }
        if self.vars == 0 {
            return Err(ExploreConfigError::Zero("vars"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_over_defaults() {
        let c = ExploreConfig::from_args(&["threads=2", "seed = 9", "steps=5"]).unwrap();
        assert_eq!(
            c,
            ExploreConfig {
                threads: 2,
                seed: 9,
                steps: 5,
                ..ExploreConfig::default()
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            ExploreConfig::from_args(&["threads"]),
            Err(ExploreConfigError::NotAPair("threads".into()))
        );
        assert_eq!(
            ExploreConfig::from_args(&["colour=blue"]),
            Err(ExploreConfigError::UnknownKey("colour".into()))
        );
        assert_eq!(
            ExploreConfig::from_args(&["vars=lots"]),
            Err(ExploreConfigError::BadNumber {
                key: "vars".into(),
                value: "lots".into()
            })
        );
        assert_eq!(
            ExploreConfig::from_args(&["capacity=0"]),
            Err(ExploreConfigError::Zero("capacity"))
        );
    }
}
