pub(crate) mod byte_array_hex {
    /// Serialize (via Serde) a byte array as a hex string.
    pub fn serialize<S: serde::Serializer>(dt: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(hex::encode(dt).as_str())
    }

    /// Deserialize (via Serde) a hex string into a byte array.
    pub fn deserialize<'de, D: serde::Deserializer<'de>>(des: D) -> Result<Vec<u8>, D::Error> {
        struct HexVisitor;
        impl<'de> serde::de::Visitor<'de> for HexVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "A hex string.")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error, {
                let r = hex::decode(v).map_err(serde::de::Error::custom)?;
                Ok(r)
            }
        }
        des.deserialize_str(HexVisitor)
    }
}

pub(crate) mod hex_list {
    use serde::{ser::SerializeSeq, Deserialize};

    /// Serialize (via Serde) a list of byte arrays as a list of hex strings.
    pub fn serialize<S: serde::Serializer>(dt: &[Vec<u8>], ser: S) -> Result<S::Ok, S::Error> {
        let mut seq = ser.serialize_seq(Some(dt.len()))?;
        for bytes in dt {
            seq.serialize_element(&hex::encode(bytes))?;
        }
        seq.end()
    }

    /// Deserialize (via Serde) a list of hex strings.
    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        des: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let strings = Vec::<String>::deserialize(des)?;
        strings
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Seconds since the Unix epoch according to the local clock.
pub(crate) fn unix_now() -> i64 { chrono::Utc::now().timestamp() }
