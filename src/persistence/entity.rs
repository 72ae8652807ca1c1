use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::PersistenceResult;

/// A persisted record type.
///
/// Entities are stored as JSON documents grouped by [`KIND`](Entity::KIND)
/// and addressed by their JSON-encoded key.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    type Key: Serialize + Clone + Send + Sync;

    /// Stable name of the entity type in the store.
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
}

pub(crate) fn encode_key<K: Serialize>(key: &K) -> PersistenceResult<String> {
    Ok(serde_json::to_string(key)?)
}

pub(crate) fn encode_entity<T: Entity>(entity: &T) -> PersistenceResult<Vec<u8>> {
    Ok(serde_json::to_vec(entity)?)
}

pub(crate) fn decode_entity<T: Entity>(document: &[u8]) -> PersistenceResult<T> {
    Ok(serde_json::from_slice(document)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sku {
        code: String,
        stock: u32,
    }

    impl Entity for Sku {
        type Key = String;
        const KIND: &'static str = "sku";

        fn key(&self) -> String {
            self.code.clone()
        }
    }

    #[test]
    fn keys_are_json_encoded() {
        assert_eq!(encode_key(&42_i64).unwrap(), "42");
        assert_eq!(encode_key(&"A-1").unwrap(), "\"A-1\"");
    }

    #[test]
    fn entity_documents_decode_back() {
        let sku = Sku {
            code: "A-1".to_string(),
            stock: 3,
        };
        let document = encode_entity(&sku).unwrap();
        assert_eq!(decode_entity::<Sku>(&document).unwrap(), sku);
        assert!(decode_entity::<Sku>(b"not json").is_err());
    }
}
