// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use std::{
    any::Any,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Locks a mutex, recovering the data if a panicking unit poisoned it.
///
/// Unit callbacks may panic while holding shared state (e.g. a timer callback), and a poisoned
/// lock must not take the rest of the run down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the message carried by a panic payload, if it's a string.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some((*s).to_owned())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

/// Displays `path` relative to `cwd`, prefixed with `./`, if it's inside `cwd`.
pub(crate) fn display_relative(cwd: &Utf8Path, path: &Utf8Path) -> String {
    if path.is_relative() {
        if path.starts_with(".") {
            return path.to_string();
        }
        return format!("./{path}");
    }
    match path.strip_prefix(cwd) {
        Ok(relative) => format!("./{relative}"),
        Err(_) => path.to_string(),
    }
}

/// Serializes a `Duration` as an integer number of microseconds.
///
/// Finished suite states are only ever serialized, so the plain form has no deserializer.
pub(crate) mod duration_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_micros().min(u128::from(u64::MAX)) as u64)
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub(crate) fn serialize<S: Serializer>(
            d: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => serializer.serialize_some(&(d.as_micros().min(u128::from(u64::MAX)) as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_micros))
        }
    }
}

/// Serializes a `Duration` as an integer number of milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_case::test_case;

    #[test_case("/work/project", "/work/project/tests/a.rs", "./tests/a.rs"; "inside cwd")]
    #[test_case("/work/project", "/elsewhere/a.rs", "/elsewhere/a.rs"; "outside cwd")]
    #[test_case("/work/project", "tests/a.rs", "./tests/a.rs"; "relative")]
    #[test_case("/work/project", "./tests/a.rs", "./tests/a.rs"; "already dotted")]
    fn relative_display(cwd: &str, path: &str, expected: &str) {
        assert_eq!(
            display_relative(Utf8Path::new(cwd), Utf8Path::new(path)),
            expected
        );
    }

    #[derive(serde::Serialize)]
    struct Timings {
        #[serde(serialize_with = "duration_micros::serialize")]
        total: Duration,
        #[serde(with = "duration_micros::option")]
        unit: Option<Duration>,
        #[serde(with = "duration_millis")]
        timeout: Duration,
    }

    #[test]
    fn duration_units() {
        let timings = Timings {
            total: Duration::from_micros(1_500),
            unit: Some(Duration::from_micros(42)),
            timeout: Duration::from_secs(5),
        };
        let json = serde_json::to_string(&timings).unwrap();
        assert_eq!(json, r#"{"total":1500,"unit":42,"timeout":5000}"#);
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload).as_deref(), Some("static message"));

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*payload).as_deref(), Some("owned message"));

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*payload), None);
    }
}
