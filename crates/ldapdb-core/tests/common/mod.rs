//! Common test utilities for directory tests.
//!
//! `MemoryDirectory` is an in-process stand-in for an LDAP server: it
//! evaluates filters, pages results with opaque cookies and records every
//! operation it receives.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;

use ldapdb_core::codec::FieldType;
use ldapdb_core::config::ConnectionSettings;
use ldapdb_core::error::{DirectoryError, DirectoryResult};
use ldapdb_core::model::{FieldDescriptor, ModelMeta};
use ldapdb_core::traits::{
    Directory, EntryAttributes, Modification, RawEntry, Scope, SearchItem, SearchPage,
    SearchRequest,
};

pub const GROUPS_DN: &str = "ou=groups,dc=nodomain";
pub const PEOPLE_DN: &str = "ou=people,dc=nodomain";

// =============================================================================
// Recorded operations
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Search {
        base: String,
        scope: Scope,
        filter: String,
        attributes: Vec<String>,
        page_size: Option<u32>,
        cookie: Option<Vec<u8>>,
    },
    Add {
        dn: String,
        attributes: EntryAttributes,
    },
    Modify {
        dn: String,
        changes: Vec<Modification>,
    },
    Rename {
        dn: String,
        new_rdn: String,
    },
    Delete {
        dn: String,
    },
}

impl Operation {
    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Search { .. })
    }
}

// =============================================================================
// In-memory directory
// =============================================================================

#[derive(Default)]
struct State {
    /// Entries in insertion order, the order a server would return them.
    entries: Vec<RawEntry>,
    containers: Vec<String>,
    operations: Vec<Operation>,
    referrals_per_page: usize,
    ignore_paging: bool,
    endless_cookies: bool,
    restart_paging: bool,
    fail_next_modify: Option<DirectoryError>,
}

pub struct MemoryDirectory {
    settings: ConnectionSettings,
    state: Mutex<State>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_settings(ConnectionSettings::default())
    }

    pub fn with_settings(settings: ConnectionSettings) -> Self {
        let state = State {
            containers: vec![
                "dc=nodomain".to_string(),
                GROUPS_DN.to_string(),
                PEOPLE_DN.to_string(),
            ],
            ..State::default()
        };
        Self {
            settings,
            state: Mutex::new(state),
        }
    }

    /// Seed an entry without recording an operation.
    pub fn insert(&self, entry: RawEntry) {
        self.state.lock().unwrap().entries.push(entry);
    }

    pub fn add_container(&self, dn: &str) {
        self.state.lock().unwrap().containers.push(dn.to_string());
    }

    /// Add `count` continuation references to every page.
    pub fn inject_referrals(&self, count: usize) {
        self.state.lock().unwrap().referrals_per_page = count;
    }

    /// Behave like a server without paged-results support.
    pub fn ignore_paging(&self) {
        self.state.lock().unwrap().ignore_paging = true;
    }

    /// Keep returning a cookie forever.
    pub fn endless_cookies(&self) {
        self.state.lock().unwrap().endless_cookies = true;
    }

    /// The next search carrying a cookie starts over from the first page,
    /// as after a reconnect.
    pub fn restart_paging_once(&self) {
        self.state.lock().unwrap().restart_paging = true;
    }

    pub fn fail_next_modify(&self, error: DirectoryError) {
        self.state.lock().unwrap().fail_next_modify = Some(error);
    }

    pub fn entry(&self, dn: &str) -> Option<RawEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.dn.eq_ignore_ascii_case(dn))
            .cloned()
    }

    pub fn dns(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.entries.iter().map(|e| e.dn.clone()).collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn writes(&self) -> Vec<Operation> {
        self.operations().into_iter().filter(Operation::is_write).collect()
    }

    pub fn searches(&self) -> usize {
        self.operations().iter().filter(|op| !op.is_write()).count()
    }

    pub fn clear_operations(&self) {
        self.state.lock().unwrap().operations.clear();
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: Option<u32>,
        cookie: Option<&[u8]>,
    ) -> DirectoryResult<SearchPage> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Search {
            base: request.base.clone(),
            scope: request.scope,
            filter: request.filter.clone(),
            attributes: request.attributes.clone(),
            page_size,
            cookie: cookie.map(<[u8]>::to_vec),
        });

        let base_is_entry = state.entries.iter().any(|e| e.dn.eq_ignore_ascii_case(&request.base));
        let base_is_container = state
            .containers
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&request.base));
        if !base_is_entry && (request.scope == Scope::Base || !base_is_container) {
            return Err(DirectoryError::NotFound {
                dn: request.base.clone(),
            });
        }

        let filter = Filter::parse(&request.filter)
            .ok_or_else(|| DirectoryError::from_result_code(87, "bad search filter", &request.base))?;

        let matched: Vec<RawEntry> = state
            .entries
            .iter()
            .filter(|e| in_scope(&e.dn, &request.base, request.scope))
            .filter(|e| filter.matches(e))
            .map(|e| project(e, &request.attributes))
            .collect();

        let restarted = cookie.is_some() && std::mem::take(&mut state.restart_paging);
        let offset = cookie
            .filter(|_| !restarted)
            .and_then(|c| std::str::from_utf8(c).ok())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);

        let (entries, next_cookie) = match page_size {
            Some(size) if !state.ignore_paging => {
                let end = (offset + size as usize).min(matched.len());
                let page: Vec<RawEntry> = matched.get(offset..end).map(<[RawEntry]>::to_vec).unwrap_or_default();
                let cookie = if end < matched.len() || state.endless_cookies {
                    end.to_string().into_bytes()
                } else {
                    Vec::new()
                };
                (page, Some(cookie))
            }
            _ => (matched, None),
        };

        let mut items: Vec<SearchItem> = entries.into_iter().map(SearchItem::Entry).collect();
        for i in 0..state.referrals_per_page {
            items.insert(
                i.min(items.len()),
                SearchItem::Referral(vec![format!("ldap://replica{i}/{}", request.base)]),
            );
        }

        Ok(SearchPage {
            items,
            cookie: next_cookie,
            restarted,
        })
    }

    async fn add(&self, dn: &str, attributes: EntryAttributes) -> DirectoryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Add {
            dn: dn.to_string(),
            attributes: attributes.clone(),
        });

        if state.entries.iter().any(|e| e.dn.eq_ignore_ascii_case(dn)) {
            return Err(DirectoryError::from_result_code(68, "entry already exists", dn));
        }

        let mut entry = RawEntry::new(dn);
        entry.attributes.extend(attributes);
        state.entries.push(entry);
        Ok(())
    }

    async fn modify(&self, dn: &str, changes: Vec<Modification>) -> DirectoryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Modify {
            dn: dn.to_string(),
            changes: changes.clone(),
        });

        if let Some(error) = state.fail_next_modify.take() {
            return Err(error);
        }

        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.dn.eq_ignore_ascii_case(dn))
            .ok_or_else(|| DirectoryError::NotFound { dn: dn.to_string() })?;

        for change in changes {
            match change {
                Modification::Replace { attribute, values } => {
                    remove_attribute(entry, &attribute);
                    entry.attributes.insert(attribute, values);
                }
                Modification::Delete { attribute } => remove_attribute(entry, &attribute),
            }
        }
        Ok(())
    }

    async fn rename(&self, dn: &str, new_rdn: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Rename {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
        });

        let new_dn = match parent_of(dn) {
            Some(parent) => format!("{new_rdn},{parent}"),
            None => new_rdn.to_string(),
        };
        if state.entries.iter().any(|e| e.dn.eq_ignore_ascii_case(&new_dn)) {
            return Err(DirectoryError::from_result_code(68, "entry already exists", &new_dn));
        }

        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.dn.eq_ignore_ascii_case(dn))
            .ok_or_else(|| DirectoryError::NotFound { dn: dn.to_string() })?;

        // The old naming values are dropped, as with deleteoldrdn.
        for (attribute, value) in split_rdn_values(new_rdn) {
            remove_attribute(entry, &attribute);
            entry.attributes.insert(attribute, vec![value.into_bytes()]);
        }
        entry.dn = new_dn;
        Ok(())
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Delete { dn: dn.to_string() });

        let before = state.entries.len();
        state.entries.retain(|e| !e.dn.eq_ignore_ascii_case(dn));
        if state.entries.len() == before {
            return Err(DirectoryError::NotFound { dn: dn.to_string() });
        }
        Ok(())
    }
}

fn remove_attribute(entry: &mut RawEntry, attribute: &str) {
    entry
        .attributes
        .retain(|name, _| !name.eq_ignore_ascii_case(attribute));
}

/// Split a DN after its first unescaped comma.
fn parent_of(dn: &str) -> Option<&str> {
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return Some(&dn[i + 1..]),
            _ => escaped = false,
        }
    }
    None
}

/// `attr=value` pairs of a (possibly multi-valued) RDN, values unescaped.
fn split_rdn_values(rdn: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in rdn.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '+' => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .filter_map(|part| {
            let (attr, value) = part.split_once('=')?;
            Some((attr.to_string(), value.to_string()))
        })
        .collect()
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
    let dn_l = dn.to_ascii_lowercase();
    let base_l = base.to_ascii_lowercase();
    match scope {
        Scope::Base => dn_l == base_l,
        Scope::OneLevel => parent_of(&dn_l).is_some_and(|p| p == base_l),
        Scope::Subtree => dn_l == base_l || dn_l.ends_with(&format!(",{base_l}")),
    }
}

fn project(entry: &RawEntry, attributes: &[String]) -> RawEntry {
    let mut out = RawEntry::new(entry.dn.clone());
    for (name, values) in &entry.attributes {
        if attributes.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            out.attributes.insert(name.clone(), values.clone());
        }
    }
    out
}

// =============================================================================
// Filter evaluation
// =============================================================================

#[derive(Debug)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Substring(String, Vec<String>),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

impl Filter {
    fn parse(input: &str) -> Option<Filter> {
        let chars: Vec<char> = input.chars().collect();
        let mut pos = 0;
        let filter = parse_filter(&chars, &mut pos)?;
        (pos == chars.len()).then_some(filter)
    }

    fn matches(&self, entry: &RawEntry) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(entry)),
            Filter::Or(children) => children.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => !entry.get(attr).is_empty(),
            Filter::Equal(attr, value) => values_of(entry, attr).any(|v| v == value.to_lowercase()),
            Filter::Substring(attr, parts) => values_of(entry, attr).any(|v| substring_match(&v, parts)),
            Filter::GreaterOrEqual(attr, value) => {
                values_of(entry, attr).any(|v| compare(&v, &value.to_lowercase()) != Ordering::Less)
            }
            Filter::LessOrEqual(attr, value) => {
                values_of(entry, attr).any(|v| compare(&v, &value.to_lowercase()) != Ordering::Greater)
            }
        }
    }
}

fn values_of<'a>(entry: &'a RawEntry, attr: &str) -> impl Iterator<Item = String> + 'a {
    entry
        .get(attr)
        .iter()
        .map(|v| String::from_utf8_lossy(v).to_lowercase())
}

fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// `parts` is the value split on `*`: initial, any..., final.
fn substring_match(value: &str, parts: &[String]) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some((last, middle)) = rest.split_last() else {
        return value == first.to_lowercase();
    };

    let first = first.to_lowercase();
    let last = last.to_lowercase();
    if !value.starts_with(&first) {
        return false;
    }
    let mut remaining = &value[first.len()..];
    for part in middle {
        let part = part.to_lowercase();
        match remaining.find(&part) {
            Some(i) => remaining = &remaining[i + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(&last)
}

fn parse_filter(chars: &[char], pos: &mut usize) -> Option<Filter> {
    if chars.get(*pos) != Some(&'(') {
        return None;
    }
    *pos += 1;

    let filter = match chars.get(*pos)? {
        '&' => {
            *pos += 1;
            Filter::And(parse_list(chars, pos)?)
        }
        '|' => {
            *pos += 1;
            Filter::Or(parse_list(chars, pos)?)
        }
        '!' => {
            *pos += 1;
            Filter::Not(Box::new(parse_filter(chars, pos)?))
        }
        _ => parse_item(chars, pos)?,
    };

    if chars.get(*pos) != Some(&')') {
        return None;
    }
    *pos += 1;
    Some(filter)
}

fn parse_list(chars: &[char], pos: &mut usize) -> Option<Vec<Filter>> {
    let mut children = Vec::new();
    while chars.get(*pos) == Some(&'(') {
        children.push(parse_filter(chars, pos)?);
    }
    Some(children)
}

fn parse_item(chars: &[char], pos: &mut usize) -> Option<Filter> {
    let start = *pos;
    while !matches!(chars.get(*pos)?, '=' | '>' | '<') {
        *pos += 1;
    }
    let attr: String = chars[start..*pos].iter().collect();

    let op = chars[*pos];
    *pos += 1;
    if op != '=' {
        if chars.get(*pos) != Some(&'=') {
            return None;
        }
        *pos += 1;
    }

    let value_start = *pos;
    while *chars.get(*pos)? != ')' {
        *pos += 1;
    }
    let raw: String = chars[value_start..*pos].iter().collect();

    Some(match op {
        '>' => Filter::GreaterOrEqual(attr, unescape(&raw)?),
        '<' => Filter::LessOrEqual(attr, unescape(&raw)?),
        _ if raw == "*" => Filter::Present(attr),
        _ if raw.contains('*') => {
            let parts = raw.split('*').map(unescape).collect::<Option<Vec<_>>>()?;
            Filter::Substring(attr, parts)
        }
        _ => Filter::Equal(attr, unescape(&raw)?),
    })
}

/// Decode `\xx` hex escapes.
fn unescape(raw: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut iter = raw.bytes();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            let hi = (iter.next()? as char).to_digit(16)?;
            let lo = (iter.next()? as char).to_digit(16)?;
            bytes.push(u8::try_from(hi * 16 + lo).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn group_model() -> ModelMeta {
    ModelMeta::new("group", GROUPS_DN)
        .with_object_classes(["posixGroup"])
        .with_field(FieldDescriptor::new("name", "cn", FieldType::Text).primary_key())
        .with_field(FieldDescriptor::new("gid", "gidNumber", FieldType::Integer))
        .with_field(FieldDescriptor::new("usernames", "memberUid", FieldType::List))
        .with_ordering(["name"])
}

pub fn person_model() -> ModelMeta {
    ModelMeta::new("person", PEOPLE_DN)
        .with_object_classes(["posixAccount", "shadowAccount", "inetOrgPerson"])
        .with_field(FieldDescriptor::new("username", "uid", FieldType::Text).primary_key())
        .with_field(FieldDescriptor::new("first_name", "givenName", FieldType::Text))
        .with_field(FieldDescriptor::new("last_name", "sn", FieldType::Text))
        .with_field(FieldDescriptor::new("full_name", "cn", FieldType::Text))
        .with_field(FieldDescriptor::new("email", "mail", FieldType::Text))
        .with_field(FieldDescriptor::new("uid", "uidNumber", FieldType::Integer))
        .with_field(FieldDescriptor::new("gid", "gidNumber", FieldType::Integer))
        .with_field(FieldDescriptor::new("home", "homeDirectory", FieldType::Text))
        .with_field(FieldDescriptor::new("date_of_birth", "birthDate", FieldType::date()).nullable())
}

pub fn group_entry(name: &str, gid: i64, members: &[&str]) -> RawEntry {
    RawEntry::new(format!("cn={name},{GROUPS_DN}"))
        .with("objectClass", ["posixGroup"])
        .with("cn", [name])
        .with("gidNumber", [gid.to_string()])
        .with("memberUid", members.iter().copied())
}

pub fn person_entry(username: &str, first: &str, last: &str, uid: i64) -> RawEntry {
    RawEntry::new(format!("uid={username},{PEOPLE_DN}"))
        .with("objectClass", ["posixAccount", "shadowAccount", "inetOrgPerson"])
        .with("uid", [username])
        .with("givenName", [first])
        .with("sn", [last])
        .with("cn", [format!("{first} {last}")])
        .with("mail", [format!("{username}@example.com")])
        .with("uidNumber", [uid.to_string()])
        .with("gidNumber", ["1000"])
        .with("homeDirectory", [format!("/home/{username}")])
}

/// A directory holding the three sample groups.
pub fn seeded_groups() -> MemoryDirectory {
    let dir = MemoryDirectory::new();
    dir.insert(group_entry("foogroup", 1000, &["foouser", "baruser"]));
    dir.insert(group_entry("bargroup", 1001, &["zoouser", "baruser"]));
    dir.insert(group_entry("wizgroup", 1002, &["wizuser", "baruser"]));
    dir
}

pub fn text(entry: &RawEntry, attribute: &str) -> Vec<String> {
    entry
        .get(attribute)
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect()
}
