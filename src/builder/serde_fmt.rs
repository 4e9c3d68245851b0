//! Wire representations that differ from the in-memory types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{de::IgnoredAny, ser::SerializeMap, Deserialize, Deserializer, Serializer};

/// Byte blobs travel as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

/// A set of port specs on the wire is an object keyed by spec with `{}`
/// values. Only the keys carry meaning; any value is accepted on input.
pub(crate) fn serialize_port_set<S>(set: &BTreeSet<String>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = s.serialize_map(Some(set.len()))?;
    for port in set {
        map.serialize_entry(port, &BTreeMap::<String, String>::new())?;
    }
    map.end()
}

pub(crate) fn deserialize_port_set<'de, D>(d: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = Option::<BTreeMap<String, IgnoredAny>>::deserialize(d)?.unwrap_or_default();
    Ok(map.into_keys().collect())
}

/// `null` decodes as an empty collection rather than an error.
pub(crate) fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}
