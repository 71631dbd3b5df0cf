// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ParallelParseError;
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr, sync::LazyLock};
use tracing::warn;

/// Returns the number of logical CPUs, or 1 if it can't be determined.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Type for the `parallel` config key: the number of runner slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parallel {
    /// Run with a fixed number of slots.
    Count(usize),

    /// Run with as many slots as there are logical CPUs.
    NumCpus,
}

impl Parallel {
    /// Gets the actual number of slots.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(slots) => slots,
            Self::NumCpus => get_num_cpus(),
        }
    }

    // Negative counts are relative to the number of CPUs, but always leave at least one slot.
    fn from_signed(n: i64) -> Option<Self> {
        match n.cmp(&0) {
            Ordering::Greater => Some(Self::Count(n as usize)),
            Ordering::Less => Some(Self::Count((get_num_cpus() as i64 + n).max(1) as usize)),
            Ordering::Equal => None,
        }
    }
}

impl Default for Parallel {
    fn default() -> Self {
        Self::Count(2)
    }
}

impl FromStr for Parallel {
    type Err = ParallelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        s.parse::<i64>()
            .ok()
            .and_then(Self::from_signed)
            .ok_or_else(|| ParallelParseError::new(s))
    }
}

impl fmt::Display for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(slots) => write!(f, "{slots}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for Parallel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Parallel;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a non-zero integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                // Values overridden on the command line arrive as strings.
                v.parse()
                    .map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &self))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Parallel::from_signed(v).ok_or_else(|| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match i64::try_from(v) {
                    Ok(v) => self.visit_i64(v),
                    Err(_) => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("3", Some(Parallel::Count(3)); "positive")]
    #[test_case("num-cpus", Some(Parallel::NumCpus); "num cpus")]
    #[test_case("0", None; "zero")]
    #[test_case("many", None; "garbage")]
    fn parse(input: &str, expected: Option<Parallel>) {
        assert_eq!(input.parse::<Parallel>().ok(), expected);
    }

    #[test]
    fn negative_is_relative_to_cpus() {
        let parallel: Parallel = "-1".parse().unwrap();
        assert_eq!(parallel.compute(), get_num_cpus().saturating_sub(1).max(1));

        let parallel: Parallel = "-100000".parse().unwrap();
        assert_eq!(parallel.compute(), 1, "at least one slot");
    }

    #[test]
    fn display_round_trips() {
        for parallel in [Parallel::Count(4), Parallel::NumCpus] {
            assert_eq!(parallel.to_string().parse::<Parallel>().unwrap(), parallel);
        }
    }
}
