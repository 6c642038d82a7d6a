//! Model metadata
//!
//! Static description of how a record type maps onto directory entries:
//! container, object classes, fields and their codecs. Models are declared
//! once and shared through a [`ModelRegistry`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::FieldType;
use crate::error::{DirectoryError, DirectoryResult};
use crate::traits::{RawEntry, Scope};
use crate::value::Value;

/// Pseudo-field naming an entry's identity.
pub const IDENTITY_FIELD: &str = "dn";

/// Alias for the first primary-key field.
pub const PK_ALIAS: &str = "pk";

/// Mapping of one record field onto one directory attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub attribute: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub primary_key: bool,
    /// Blank values decode to `Null` instead of the zero value.
    #[serde(default)]
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, attribute: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            field_type,
            primary_key: false,
            nullable: false,
        }
    }

    /// Mark this field as part of the entry's relative identity.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn is_multi_valued(&self) -> bool {
        self.field_type == FieldType::List
    }

    pub fn decode(&self, raw: &[Vec<u8>]) -> Value {
        self.field_type.decode(raw, self.nullable)
    }

    pub fn encode(&self, value: &Value) -> DirectoryResult<Vec<Vec<u8>>> {
        self.field_type.encode(&self.name, value)
    }
}

/// Everything the core needs to know about a record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    pub base_dn: String,
    pub object_classes: Vec<String>,
    pub fields: Vec<FieldDescriptor>,
    /// Default ordering, e.g. `["name", "-gid"]`.
    #[serde(default)]
    pub ordering: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
}

impl ModelMeta {
    pub fn new(name: impl Into<String>, base_dn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_dn: base_dn.into(),
            object_classes: Vec::new(),
            fields: Vec::new(),
            ordering: Vec::new(),
            scope: Scope::Subtree,
        }
    }

    #[must_use]
    pub fn with_object_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.object_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = ordering.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// The same model, rooted in another container.
    #[must_use]
    pub fn scoped(&self, base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            ..self.clone()
        }
    }

    /// Look up a field by name; `pk` resolves to the first primary key.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        if name == PK_ALIAS {
            return self.primary_keys().next();
        }
        self.fields.iter().find(|f| f.name == name)
    }

    /// Like [`field`](Self::field) but an unknown name is an invalid query.
    pub fn require_field(&self, name: &str) -> DirectoryResult<&FieldDescriptor> {
        self.field(name).ok_or_else(|| {
            DirectoryError::invalid_query(format!("model '{}' has no field '{name}'", self.name))
        })
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.primary_key)
    }

    /// Protocol attributes of every field, in declaration order.
    pub fn attributes(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.attribute.clone()).collect()
    }

    /// Decode every field of a raw entry.
    pub fn decode_entry(&self, entry: &RawEntry) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.decode(entry.get(&f.attribute))))
            .collect()
    }

    /// Relative identity built from the primary-key values.
    ///
    /// Several keys are joined with `+`; each value is escaped for use in a DN.
    pub fn build_rdn(&self, values: &BTreeMap<String, Value>) -> DirectoryResult<String> {
        let mut parts = Vec::new();

        for field in self.primary_keys() {
            let value = values.get(&field.name).cloned().unwrap_or_default();
            let encoded = field.encode(&value)?;
            let first = encoded.first().ok_or_else(|| DirectoryError::Data {
                dn: self.base_dn.clone(),
                message: format!("primary key '{}' has no value", field.name),
            })?;
            let text = String::from_utf8_lossy(first);
            parts.push(format!("{}={}", field.attribute, escape_dn_value(&text)));
        }

        if parts.is_empty() {
            return Err(DirectoryError::invalid_configuration(format!(
                "model '{}' declares no primary key",
                self.name
            )));
        }

        Ok(parts.join("+"))
    }

    /// Full identity: relative identity under the model's container.
    pub fn build_dn(&self, values: &BTreeMap<String, Value>) -> DirectoryResult<String> {
        let rdn = self.build_rdn(values)?;
        if self.base_dn.is_empty() {
            return Ok(rdn);
        }
        Ok(format!("{rdn},{}", self.base_dn))
    }

    /// Validate the model declaration.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.object_classes.is_empty() {
            return Err(DirectoryError::invalid_configuration(format!(
                "model '{}' declares no object classes",
                self.name
            )));
        }
        if self.primary_keys().next().is_none() {
            return Err(DirectoryError::invalid_configuration(format!(
                "model '{}' declares no primary key",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name == IDENTITY_FIELD || field.name == PK_ALIAS {
                return Err(DirectoryError::invalid_configuration(format!(
                    "model '{}': field name '{}' is reserved",
                    self.name, field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(DirectoryError::invalid_configuration(format!(
                    "model '{}': duplicate field '{}'",
                    self.name, field.name
                )));
            }
            if field.primary_key && field.field_type == FieldType::List {
                return Err(DirectoryError::invalid_configuration(format!(
                    "model '{}': primary key '{}' cannot be multi-valued",
                    self.name, field.name
                )));
            }
        }

        for key in &self.ordering {
            let name = key.strip_prefix('-').unwrap_or(key);
            if name != IDENTITY_FIELD && self.field(name).is_none() {
                return Err(DirectoryError::invalid_configuration(format!(
                    "model '{}': default ordering uses unknown field '{name}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Escape a value for use in a DN (RFC 4514).
pub fn escape_dn_value(value: &str) -> String {
    let count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == count;

        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

/// Split a DN into its first RDN and the parent DN.
///
/// Escaped commas (`\,`) do not split.
pub fn split_rdn(dn: &str) -> (&str, Option<&str>) {
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ',' => return (&dn[..i], Some(dn[i + 1..].trim_start())),
            _ => {}
        }
    }
    (dn, None)
}

/// Whether two RDNs name the same entry.
///
/// Attribute types compare case-insensitively and values compare after
/// unescaping, so `CN=a\2Cb` equals `cn=a\,b`. The parts of a multi-valued
/// RDN may appear in any order.
pub fn rdn_equals(a: &str, b: &str) -> bool {
    let mut left = rdn_components(a);
    let mut right = rdn_components(b);
    left.sort();
    right.sort();
    left == right
}

/// `(lowercased type, unescaped value)` pairs of an RDN.
fn rdn_components(rdn: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in rdn.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '+' => {
                parts.push(&rdn[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&rdn[start..]);

    parts
        .into_iter()
        .map(|ava| match ava.split_once('=') {
            Some((attr, value)) => (attr.trim().to_ascii_lowercase(), unescape_dn_value(value)),
            None => (ava.trim().to_ascii_lowercase(), String::new()),
        })
        .collect()
}

/// Undo RFC 4514 escaping: `\,` style pairs and `\2C` style hex bytes.
fn unescape_dn_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let hex = bytes
            .get(i + 1..i + 3)
            .filter(|pair| pair.iter().all(u8::is_ascii_hexdigit))
            .and_then(|pair| std::str::from_utf8(pair).ok())
            .and_then(|pair| u8::from_str_radix(pair, 16).ok());
        match hex {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i + 1]);
                i += 2;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Registered models, keyed by name.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelMeta>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a model. Each name may be registered once.
    pub fn register(&mut self, meta: ModelMeta) -> DirectoryResult<Arc<ModelMeta>> {
        meta.validate()?;
        if self.models.contains_key(&meta.name) {
            return Err(DirectoryError::invalid_configuration(format!(
                "model '{}' is already registered",
                meta.name
            )));
        }
        let meta = Arc::new(meta);
        self.models.insert(meta.name.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelMeta>> {
        self.models.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
