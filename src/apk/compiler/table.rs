use crate::apk::res::{
    Chunk, ResTableConfig, ResTableEntry, ResTableHeader, ResTablePackageHeader, ResTableRef,
    ResTableTypeHeader, ResTableTypeSpecHeader, ResValue, ResValueType,
};
use crate::error::{Error, Result};
use roxmltree::Document;
use std::collections::BTreeMap;

/// Package id of application resources.
pub const APP_PACKAGE_ID: u8 = 0x7f;
/// Type id of the only resource type in the table.
pub const STRING_TYPE_ID: u8 = 1;

/// String resources of one package, kept sorted by name so that entry ids,
/// and with them the encoded table, do not depend on insertion order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringTable {
    entries: BTreeMap<String, String>,
}

impl StringTable {
    /// Placeholder strings every synthesized table starts from.
    pub fn seeded(app_name: &str) -> Self {
        Self::from_iter([("app_name", app_name), ("button_text", "Click Me")])
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Resource id of the entry called `name`. Entry ids are 16 bits wide.
    pub fn reference(&self, name: &str) -> Result<Option<ResTableRef>> {
        let Some(entry) = self.entries.keys().position(|key| key == name) else {
            return Ok(None);
        };
        let entry = u16::try_from(entry).map_err(|_| {
            Error::encoding(format!("string resource `{name}` is entry {entry}, past 0xffff"))
        })?;
        Ok(Some(ResTableRef::new(APP_PACKAGE_ID, STRING_TYPE_ID, entry)))
    }

    /// Resolves a `@string/<name>` reference to a resource id.
    pub fn resolve(&self, value: &str) -> Result<Option<ResTableRef>> {
        match value.strip_prefix("@string/") {
            Some(name) => self.reference(name),
            None => Ok(None),
        }
    }

    /// Merges `<string>` elements of a `res/values` document.
    pub fn extend_from_values_xml(&mut self, xml: &str) -> Result<usize> {
        let doc = Document::parse(xml).map_err(|err| Error::encoding(err.to_string()))?;
        let mut count = 0;
        for node in doc
            .root_element()
            .children()
            .filter(|node| node.has_tag_name("string"))
        {
            if let Some(name) = node.attribute("name") {
                self.insert(name, node.text().unwrap_or_default().trim());
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn to_chunk(&self, package_name: &str) -> Result<Chunk> {
        let mut values = vec!["string".to_string(), "android".to_string()];
        for (name, value) in self.iter() {
            for s in [name, value] {
                if !values.iter().any(|v| v == s) {
                    values.push(s.to_string());
                }
            }
        }
        let index = |s: &str| -> u32 {
            values
                .iter()
                .position(|v| v == s)
                .map(|i| i as u32)
                .unwrap_or_default()
        };

        let mut entries = Vec::with_capacity(self.len());
        for (key, (_, value)) in self.iter().enumerate() {
            let value = match self.resolve(value)? {
                Some(reference) => ResValue::new(ResValueType::Reference, reference.into()),
                None => ResValue::new(ResValueType::String, index(value)),
            };
            entries.push(Some(ResTableEntry::simple(key as u32, value)));
        }
        let keys = self.entries.keys().cloned().collect::<Vec<_>>();
        let entry_count = keys.len() as u32;

        Ok(Chunk::Table(
            ResTableHeader { package_count: 1 },
            vec![
                Chunk::StringPool(values),
                Chunk::TablePackage(
                    ResTablePackageHeader {
                        id: APP_PACKAGE_ID as u32,
                        name: package_name.to_string(),
                        type_strings: 0,
                        last_public_type: 0,
                        key_strings: 0,
                        last_public_key: 0,
                        type_id_offset: 0,
                    },
                    vec![
                        Chunk::StringPool(vec!["string".to_string()]),
                        Chunk::StringPool(keys),
                        Chunk::TableTypeSpec(
                            ResTableTypeSpecHeader {
                                id: STRING_TYPE_ID,
                                res0: 0,
                                res1: 0,
                                entry_count,
                            },
                            vec![0; entry_count as usize],
                        ),
                        Chunk::TableType(
                            ResTableTypeHeader {
                                id: STRING_TYPE_ID,
                                res0: 0,
                                res1: 0,
                                entry_count,
                                entries_start: 0,
                                config: ResTableConfig::default(),
                            },
                            entries,
                        ),
                    ],
                ),
            ],
        ))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StringTable {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut table = Self::default();
        for (name, value) in iter {
            table.insert(name, value);
        }
        table
    }
}

/// Encodes a single-package `resources.arsc` holding `resources` as
/// `string` entries.
pub fn encode_resource_table(package_name: &str, resources: &StringTable) -> Result<Vec<u8>> {
    if package_name.is_empty() {
        return Err(Error::encoding("resource table needs a package name"));
    }
    let bytes = resources.to_chunk(package_name)?.to_bytes()?;
    tracing::debug!(
        "encoded resource table with {} strings ({} bytes)",
        resources.len(),
        bytes.len()
    );
    Ok(bytes)
}
