use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A value that may be written either as a single item or as a list.
///
/// `"domain": "a.com"` and `"domain": ["a.com"]` both deserialize to a
/// one-element list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Listable<T> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(v: Vec<T>) -> Self {
        Self(v)
    }
}

impl<'a, T> IntoIterator for &'a Listable<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Listable<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            One(T),
            Many(Vec<T>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::One(v) => Ok(Self(vec![v])),
            Raw::Many(v) => Ok(Self(v)),
        }
    }
}

impl<T: Serialize> Serialize for Listable<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0.len() == 1 {
            self.0[0].serialize(serializer)
        } else {
            self.0.serialize(serializer)
        }
    }
}

/// Serde helpers for durations written as "10s" / "500ms" / "1h30m" strings,
/// or as a bare integer number of seconds.
pub mod duration {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Secs(s)) => Ok(Some(Duration::from_secs(s))),
            Some(Raw::Text(s)) if s.is_empty() => Ok(None),
            Some(Raw::Text(s)) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid duration {s:?}: {e}"))),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Serialize)]
    struct Holder {
        #[serde(default)]
        items: Listable<String>,
        #[serde(default, with = "duration")]
        every: Option<Duration>,
    }

    #[test]
    fn listable_accepts_scalar_and_list() {
        let h: Holder = serde_json::from_str(r#"{"items":"a"}"#).unwrap();
        assert_eq!(h.items.0, vec!["a".to_string()]);
        let h: Holder = serde_json::from_str(r#"{"items":["a","b"]}"#).unwrap();
        assert_eq!(h.items.len(), 2);
        let h: Holder = serde_json::from_str("{}").unwrap();
        assert!(h.items.is_empty());
    }

    #[test]
    fn duration_forms() {
        let h: Holder = serde_json::from_str(r#"{"every":"1m30s"}"#).unwrap();
        assert_eq!(h.every, Some(Duration::from_secs(90)));
        let h: Holder = serde_json::from_str(r#"{"every":5}"#).unwrap();
        assert_eq!(h.every, Some(Duration::from_secs(5)));
        assert!(serde_json::from_str::<Holder>(r#"{"every":"soon"}"#).is_err());
    }
}
