use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClothingItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Data URI of the item photo, as handed to the model.
    pub image: String,
    pub added_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonImage {
    pub image: String,
    pub updated_at: String,
}

/// A curation the user chose to keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outfit {
    pub id: String,
    pub occasion: String,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub item_names: Vec<String>,
    pub suggestion: String,
    pub image_path: Option<String>,
    pub saved_at: String,
}

/// File-backed wardrobe: clothing items, the optional person photo, and
/// saved outfits. Same tolerance rules as the chat transcript — a missing
/// or unreadable file starts empty, bad entries are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct WardrobeStore {
    pub path: PathBuf,
    pub schema_version: u64,
    pub items: Vec<ClothingItem>,
    pub person: Option<PersonImage>,
    pub outfits: Vec<Outfit>,
}

impl WardrobeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            items: Vec::new(),
            person: None,
            outfits: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return store;
        };

        store.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(store.schema_version);
        if let Some(items) = obj.get("items").and_then(Value::as_array) {
            for item in items {
                if let Ok(parsed) = serde_json::from_value::<ClothingItem>(item.clone()) {
                    store.items.push(parsed);
                }
            }
        }
        if let Some(person) = obj.get("person") {
            store.person = serde_json::from_value::<PersonImage>(person.clone()).ok();
        }
        if let Some(outfits) = obj.get("outfits").and_then(Value::as_array) {
            for outfit in outfits {
                if let Ok(parsed) = serde_json::from_value::<Outfit>(outfit.clone()) {
                    store.outfits.push(parsed);
                }
            }
        }
        store
    }

    pub fn add_item(&mut self, name: &str, description: &str, image: &str) -> ClothingItem {
        let item = ClothingItem {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            image: image.to_string(),
            added_at: now_utc_iso(),
        };
        self.items.push(item.clone());
        item
    }

    pub fn remove_item(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    pub fn get_item(&self, id: &str) -> Option<&ClothingItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn set_person(&mut self, image: &str) {
        self.person = Some(PersonImage {
            image: image.to_string(),
            updated_at: now_utc_iso(),
        });
    }

    pub fn save_outfit(
        &mut self,
        occasion: &str,
        items: &[ClothingItem],
        suggestion: &str,
        image_path: Option<&str>,
    ) -> Outfit {
        let outfit = Outfit {
            id: Uuid::new_v4().to_string(),
            occasion: occasion.to_string(),
            item_ids: items.iter().map(|item| item.id.clone()).collect(),
            item_names: items.iter().map(|item| item.name.clone()).collect(),
            suggestion: suggestion.to_string(),
            image_path: image_path.map(str::to_string),
            saved_at: now_utc_iso(),
        };
        self.outfits.push(outfit.clone());
        outfit
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "items".to_string(),
            Value::Array(
                self.items
                    .iter()
                    .map(|item| serde_json::to_value(item).unwrap_or(Value::Null))
                    .collect(),
            ),
        );
        payload.insert(
            "person".to_string(),
            self.person
                .as_ref()
                .and_then(|person| serde_json::to_value(person).ok())
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "outfits".to_string(),
            Value::Array(
                self.outfits
                    .iter()
                    .map(|outfit| serde_json::to_value(outfit).unwrap_or(Value::Null))
                    .collect(),
            ),
        );

        write_json(&self.path, Value::Object(payload))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::WardrobeStore;

    const PNG_URI: &str = "data:image/png;base64,iVBORw0KGgo=";

    #[test]
    fn wardrobe_roundtrip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("wardrobe.json");
        let mut store = WardrobeStore::new(&path);

        let shirt = store.add_item("white shirt", "oxford cotton", PNG_URI);
        store.add_item("navy blazer", "", PNG_URI);
        store.set_person(PNG_URI);
        store.save_outfit(
            "gallery opening",
            &[shirt.clone()],
            "White shirt under the navy blazer.",
            Some("/tmp/outfit.png"),
        );
        store.save()?;

        let loaded = WardrobeStore::load(&path);
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.items[0].name, "white shirt");
        assert!(loaded.person.is_some());
        assert_eq!(loaded.outfits.len(), 1);
        assert_eq!(loaded.outfits[0].item_ids, vec![shirt.id]);
        assert_eq!(loaded.outfits[0].item_names, vec!["white shirt"]);
        Ok(())
    }

    #[test]
    fn remove_item_by_id() {
        let mut store = WardrobeStore::new("/tmp/unused.json");
        let item = store.add_item("scarf", "", PNG_URI);
        assert!(store.get_item(&item.id).is_some());
        assert!(store.remove_item(&item.id));
        assert!(store.get_item(&item.id).is_none());
        assert!(!store.remove_item(&item.id));
        assert!(store.items.is_empty());
    }

    #[test]
    fn load_tolerates_corrupt_store() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("wardrobe.json");
        std::fs::write(&path, "{\"items\": \"oops\"}")?;
        let store = WardrobeStore::load(&path);
        assert!(store.items.is_empty());
        assert!(store.outfits.is_empty());
        Ok(())
    }
}
