//! Predicate compiler
//!
//! Lowers a [`Predicate`] tree into an LDAP filter (RFC 4515). Clauses are
//! first built as templates with one `%s` placeholder per operand; operands
//! are escaped and substituted only when the filter is rendered, so values
//! never reach the filter unescaped.
//!
//! An exact match on the `dn` pseudo-field is not a filter at all: it turns
//! the search into a base-scope lookup of that entry.

use crate::error::{DirectoryError, DirectoryResult};
use crate::model::{FieldDescriptor, ModelMeta, IDENTITY_FIELD};
use crate::predicate::{Connector, Lookup, Operand, Predicate};
use crate::traits::{Scope, SearchRequest};
use crate::value::Value;

/// Operand placeholder in filter templates.
pub const PLACEHOLDER: &str = "%s";

const OBJECT_CLASS: &str = "objectClass";

/// Filter template plus the raw (unescaped) operands it expects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    pub template: String,
    pub params: Vec<String>,
}

impl CompiledFilter {
    fn new(template: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            template: template.into(),
            params,
        }
    }

    /// Substitute escaped operands into the template, left to right.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.template.len() + 16 * self.params.len());
        let mut params = self.params.iter();
        let mut pieces = self.template.split(PLACEHOLDER);

        if let Some(first) = pieces.next() {
            out.push_str(first);
        }
        for piece in pieces {
            if let Some(param) = params.next() {
                out.push_str(&escape_filter_value(param));
            }
            out.push_str(piece);
        }
        out
    }

    /// Wrap several clauses with a connective, e.g. `(&(a)(b))`.
    fn join(prefix: &str, clauses: Vec<CompiledFilter>) -> Self {
        let mut template = format!("({prefix}");
        let mut params = Vec::new();
        for clause in clauses {
            template.push_str(&clause.template);
            params.extend(clause.params);
        }
        template.push(')');
        Self { template, params }
    }
}

/// Escape special characters in a filter value (RFC 4515).
///
/// Only the structural characters are escaped; non-ASCII passes through.
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(ch),
        }
    }
    out
}

/// Output of compiling a query: where to search and with which filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub base: String,
    pub scope: Scope,
    pub filter: CompiledFilter,
}

impl CompiledQuery {
    /// Build the search request for these attributes.
    pub fn to_request(&self, attributes: Vec<String>) -> SearchRequest {
        SearchRequest {
            base: self.base.clone(),
            scope: self.scope,
            filter: self.filter.render(),
            attributes,
        }
    }

    /// Check if the query addresses a single entry by identity.
    pub fn is_identity_lookup(&self) -> bool {
        self.scope == Scope::Base
    }
}

/// Compiles predicate trees against one model.
#[derive(Debug, Clone, Copy)]
pub struct PredicateCompiler<'a> {
    meta: &'a ModelMeta,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(meta: &'a ModelMeta) -> Self {
        Self { meta }
    }

    /// Compile a full query: identity extraction, object classes and predicate.
    pub fn compile(&self, root: &Predicate) -> DirectoryResult<CompiledQuery> {
        let (identity, remainder) = split_identity(root)?;

        let mut clauses: Vec<CompiledFilter> = self
            .meta
            .object_classes
            .iter()
            .map(|class| CompiledFilter::new(format!("({OBJECT_CLASS}={PLACEHOLDER})"), vec![class.clone()]))
            .collect();

        let mut conditions = Vec::with_capacity(remainder.len());
        for node in remainder {
            conditions.extend(self.compile_where(node)?);
        }
        conditions.sort_by_cached_key(CompiledFilter::render);
        match conditions.len() {
            0 => {}
            1 => clauses.append(&mut conditions),
            _ => clauses.push(CompiledFilter::join("&", conditions)),
        }

        let filter = match clauses.len() {
            0 => CompiledFilter::new(format!("({OBJECT_CLASS}=*)"), Vec::new()),
            1 => clauses.remove(0),
            _ => CompiledFilter::join("&", clauses),
        };

        let (base, scope) = match identity {
            Some(dn) => (dn, Scope::Base),
            None => (self.meta.base_dn.clone(), self.meta.scope),
        };

        Ok(CompiledQuery {
            base,
            scope,
            filter,
        })
    }

    /// Compile a predicate subtree. `None` means the subtree is always true.
    pub fn compile_where(&self, node: &Predicate) -> DirectoryResult<Option<CompiledFilter>> {
        match node {
            Predicate::Leaf {
                field,
                lookup,
                operand,
            } => self.compile_leaf(field, *lookup, operand).map(Some),
            Predicate::Composite {
                connector,
                negated,
                children,
            } => {
                let mut compiled = Vec::with_capacity(children.len());
                for child in children {
                    if let Some(clause) = self.compile_where(child)? {
                        compiled.push(clause);
                    }
                }

                // Canonical sibling order, so equal trees render identically.
                compiled.sort_by_cached_key(CompiledFilter::render);

                let clause = match compiled.len() {
                    0 => return Ok(None),
                    1 => compiled.remove(0),
                    _ => {
                        let prefix = match connector {
                            Connector::And => "&",
                            Connector::Or => "|",
                        };
                        CompiledFilter::join(prefix, compiled)
                    }
                };

                if *negated {
                    Ok(Some(CompiledFilter::join("!", vec![clause])))
                } else {
                    Ok(Some(clause))
                }
            }
        }
    }

    fn compile_leaf(
        &self,
        name: &str,
        lookup: Lookup,
        operand: &Operand,
    ) -> DirectoryResult<CompiledFilter> {
        if name == IDENTITY_FIELD {
            return Err(DirectoryError::invalid_query(format!(
                "lookup '{lookup}' on '{IDENTITY_FIELD}' is only supported as a top-level exact match"
            )));
        }

        let field = self.meta.require_field(name)?;
        if !field.field_type.supports(lookup) {
            return Err(DirectoryError::invalid_query(format!(
                "field '{}' does not support lookup '{lookup}'",
                field.name
            )));
        }

        let attr = &field.attribute;

        if lookup == Lookup::In {
            let values = match operand {
                Operand::Many(values) => values.clone(),
                Operand::Single(Value::List(items)) => {
                    items.iter().cloned().map(Value::Text).collect()
                }
                Operand::Single(_) => {
                    return Err(DirectoryError::invalid_query(format!(
                        "lookup 'in' on '{}' needs a list of values",
                        field.name
                    )))
                }
            };
            return self.compile_in(field, &values);
        }

        let value = match operand {
            Operand::Single(value) => value,
            Operand::Many(_) => {
                return Err(DirectoryError::invalid_query(format!(
                    "lookup '{lookup}' on '{}' takes a single value",
                    field.name
                )))
            }
        };
        let param = field.field_type.render_operand(&field.name, value)?;

        let template = match lookup {
            Lookup::Exact | Lookup::In => format!("({attr}={PLACEHOLDER})"),
            Lookup::Contains if field.is_multi_valued() => format!("({attr}={PLACEHOLDER})"),
            Lookup::StartsWith => format!("({attr}={PLACEHOLDER}*)"),
            Lookup::EndsWith => format!("({attr}=*{PLACEHOLDER})"),
            Lookup::Contains | Lookup::IContains => format!("({attr}=*{PLACEHOLDER}*)"),
            Lookup::Gte => format!("({attr}>={PLACEHOLDER})"),
            Lookup::Lte => format!("({attr}<={PLACEHOLDER})"),
        };

        Ok(CompiledFilter::new(template, vec![param]))
    }

    fn compile_in(&self, field: &FieldDescriptor, values: &[Value]) -> DirectoryResult<CompiledFilter> {
        let attr = &field.attribute;
        let mut clauses = Vec::with_capacity(values.len());
        for value in values {
            let param = field.field_type.render_operand(&field.name, value)?;
            clauses.push(CompiledFilter::new(format!("({attr}={PLACEHOLDER})"), vec![param]));
        }

        Ok(match clauses.len() {
            // An empty OR never matches.
            0 => CompiledFilter::new("(|)", Vec::new()),
            1 => clauses.remove(0),
            _ => CompiledFilter::join("|", clauses),
        })
    }
}

/// Pull a top-level `dn` exact match out of the tree.
///
/// Returns the identity, if any, and the nodes left to compile.
fn split_identity(root: &Predicate) -> DirectoryResult<(Option<String>, Vec<&Predicate>)> {
    match root {
        Predicate::Leaf { .. } => match identity_of(root)? {
            Some(dn) => Ok((Some(dn), Vec::new())),
            None => Ok((None, vec![root])),
        },
        Predicate::Composite {
            connector: Connector::And,
            negated: false,
            children,
        } => {
            let mut identity: Option<String> = None;
            let mut rest = Vec::with_capacity(children.len());

            for child in children {
                match identity_of(child)? {
                    Some(dn) => match &identity {
                        Some(existing) if *existing != dn => {
                            return Err(DirectoryError::invalid_query(format!(
                                "conflicting identity lookups '{existing}' and '{dn}'"
                            )))
                        }
                        _ => identity = Some(dn),
                    },
                    None => rest.push(child),
                }
            }

            Ok((identity, rest))
        }
        Predicate::Composite { .. } => Ok((None, vec![root])),
    }
}

/// The dn of an exact identity leaf, `None` for any other node.
fn identity_of(node: &Predicate) -> DirectoryResult<Option<String>> {
    match node {
        Predicate::Leaf {
            field,
            lookup: Lookup::Exact,
            operand: Operand::Single(value),
        } if field == IDENTITY_FIELD => match value {
            Value::Text(dn) if !dn.is_empty() => Ok(Some(dn.clone())),
            other => Err(DirectoryError::invalid_query(format!(
                "identity lookup needs a non-empty dn, got {}",
                other.kind_name()
            ))),
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldType;
    use chrono::NaiveDate;

    fn group_model() -> ModelMeta {
        ModelMeta::new("group", "ou=groups,dc=nodomain")
            .with_object_classes(["posixGroup"])
            .with_field(FieldDescriptor::new("name", "cn", FieldType::Text).primary_key())
            .with_field(FieldDescriptor::new("gid", "gidNumber", FieldType::Integer))
            .with_field(FieldDescriptor::new("usernames", "memberUid", FieldType::List))
    }

    fn user_model() -> ModelMeta {
        ModelMeta::new("user", "ou=people,dc=nodomain")
            .with_object_classes(["posixAccount", "shadowAccount", "inetOrgPerson"])
            .with_field(FieldDescriptor::new("username", "uid", FieldType::Text).primary_key())
            .with_field(FieldDescriptor::new("first_name", "givenName", FieldType::Text))
            .with_field(FieldDescriptor::new("uid", "uidNumber", FieldType::Integer))
            .with_field(FieldDescriptor::new("date_of_birth", "birthday", FieldType::date()).nullable())
            .with_field(FieldDescriptor::new("photo", "jpegPhoto", FieldType::Binary))
    }

    fn filter(meta: &ModelMeta, root: &Predicate) -> String {
        PredicateCompiler::new(meta).compile(root).unwrap().filter.render()
    }

    #[test]
    fn test_single_equality() {
        assert_eq!(
            filter(&group_model(), &Predicate::eq("name", "foogroup")),
            "(&(objectClass=posixGroup)(cn=foogroup))"
        );
    }

    #[test]
    fn test_exclude_two_fields() {
        let root = Predicate::and(vec![Predicate::eq("name", "foogroup"), Predicate::eq("gid", 1000)])
            .negate();
        assert_eq!(
            filter(&group_model(), &root),
            "(&(objectClass=posixGroup)(!(&(cn=foogroup)(gidNumber=1000))))"
        );
    }

    #[test]
    fn test_sibling_order_is_canonical() {
        let meta = group_model();
        let a = Predicate::or(vec![Predicate::eq("gid", 1000), Predicate::eq("name", "foogroup")]);
        let b = Predicate::or(vec![Predicate::eq("name", "foogroup"), Predicate::eq("gid", 1000)]);
        assert_eq!(filter(&meta, &a), filter(&meta, &b));
        assert_eq!(
            filter(&meta, &a),
            "(&(objectClass=posixGroup)(|(cn=foogroup)(gidNumber=1000)))"
        );
    }

    #[test]
    fn test_single_child_is_not_wrapped() {
        let meta = group_model();
        let compiler = PredicateCompiler::new(&meta);
        let leaf = Predicate::eq("name", "foogroup");

        assert_eq!(
            compiler.compile_where(&Predicate::and(vec![leaf.clone()])).unwrap(),
            compiler.compile_where(&leaf).unwrap()
        );
        assert_eq!(
            compiler.compile_where(&Predicate::or(vec![leaf.clone()])).unwrap(),
            compiler.compile_where(&leaf).unwrap()
        );
    }

    #[test]
    fn test_empty_composites_compile_to_object_classes() {
        let meta = group_model();
        assert_eq!(filter(&meta, &Predicate::and(vec![])), "(objectClass=posixGroup)");
        assert_eq!(filter(&meta, &Predicate::or(vec![])), "(objectClass=posixGroup)");

        assert_eq!(
            filter(&user_model(), &Predicate::all()),
            "(&(objectClass=posixAccount)(objectClass=shadowAccount)(objectClass=inetOrgPerson))"
        );
    }

    #[test]
    fn test_escaping() {
        let meta = group_model();
        for raw in ["foo*", "(foo)", "a\\b", "x)(cn=*"] {
            let rendered = filter(&meta, &Predicate::eq("name", raw));
            let clause = rendered
                .strip_prefix("(&(objectClass=posixGroup)(cn=")
                .and_then(|s| s.strip_suffix("))"))
                .unwrap();
            assert!(!clause.contains('*'), "{rendered}");
            assert!(!clause.contains('('), "{rendered}");
            assert!(!clause.contains(')'), "{rendered}");
        }

        assert_eq!(
            filter(&meta, &Predicate::eq("name", "x)(cn=*")),
            "(&(objectClass=posixGroup)(cn=x\\29\\28cn=\\2a))"
        );
        assert_eq!(escape_filter_value("Séverine"), "Séverine");
        assert_eq!(escape_filter_value("a\0b"), "a\\00b");
    }

    #[test]
    fn test_wildcard_lookups() {
        let meta = group_model();
        let compiler = PredicateCompiler::new(&meta);
        let render = |p: Predicate| compiler.compile_where(&p).unwrap().unwrap().render();

        assert_eq!(render(Predicate::starts_with("name", "foo")), "(cn=foo*)");
        assert_eq!(render(Predicate::ends_with("name", "group")), "(cn=*group)");
        assert_eq!(render(Predicate::contains("name", "oog")), "(cn=*oog*)");
        assert_eq!(render(Predicate::icontains("name", "OOG")), "(cn=*OOG*)");
        assert_eq!(render(Predicate::starts_with("name", "a*")), "(cn=a\\2a*)");
        assert_eq!(render(Predicate::gte("gid", 1000)), "(gidNumber>=1000)");
        assert_eq!(render(Predicate::lte("gid", 1002)), "(gidNumber<=1002)");
        assert_eq!(render(Predicate::contains("usernames", "foouser")), "(memberUid=foouser)");
    }

    #[test]
    fn test_in_lookup() {
        let meta = group_model();
        let compiler = PredicateCompiler::new(&meta);
        let render = |p: Predicate| compiler.compile_where(&p).unwrap().unwrap().render();

        assert_eq!(
            render(Predicate::is_in("name", ["foogroup", "bargroup"])),
            "(|(cn=foogroup)(cn=bargroup))"
        );
        assert_eq!(render(Predicate::is_in("name", ["foogroup"])), "(cn=foogroup)");
        assert_eq!(render(Predicate::is_in("name", Vec::<String>::new())), "(|)");
        assert_eq!(render(Predicate::is_in("gid", [1000, 1001])), "(|(gidNumber=1000)(gidNumber=1001))");
    }

    #[test]
    fn test_date_lookup_uses_format() {
        let meta = user_model();
        let date = NaiveDate::from_ymd_opt(1978, 11, 8).unwrap();
        assert_eq!(
            PredicateCompiler::new(&meta)
                .compile_where(&Predicate::gte("date_of_birth", date))
                .unwrap()
                .unwrap()
                .render(),
            "(birthday>=1978-11-08)"
        );
    }

    #[test]
    fn test_unsupported_lookups() {
        let meta = user_model();
        let compiler = PredicateCompiler::new(&meta);

        for p in [
            Predicate::contains("uid", 5),
            Predicate::eq("photo", vec![1_u8, 2]),
            Predicate::starts_with("date_of_birth", "1978"),
            Predicate::eq("nope", "x"),
        ] {
            let err = compiler.compile(&p).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_QUERY", "{p:?}");
        }
    }

    #[test]
    fn test_identity_lookup_uses_base_scope() {
        let meta = group_model();
        let compiled = PredicateCompiler::new(&meta)
            .compile(&Predicate::eq("dn", "cn=foogroup,ou=groups,dc=nodomain"))
            .unwrap();

        assert_eq!(compiled.base, "cn=foogroup,ou=groups,dc=nodomain");
        assert_eq!(compiled.scope, Scope::Base);
        assert_eq!(compiled.filter.render(), "(objectClass=posixGroup)");
        assert!(compiled.is_identity_lookup());
    }

    #[test]
    fn test_identity_inside_and() {
        let meta = group_model();
        let root = Predicate::eq("dn", "cn=foogroup,ou=groups,dc=nodomain") & Predicate::eq("gid", 1000);
        let compiled = PredicateCompiler::new(&meta).compile(&root).unwrap();

        assert_eq!(compiled.scope, Scope::Base);
        assert_eq!(
            compiled.filter.render(),
            "(&(objectClass=posixGroup)(gidNumber=1000))"
        );
    }

    #[test]
    fn test_identity_misuse_rejected() {
        let meta = group_model();
        let compiler = PredicateCompiler::new(&meta);

        let cases = [
            Predicate::starts_with("dn", "cn=foo"),
            !Predicate::eq("dn", "cn=foogroup,ou=groups,dc=nodomain"),
            Predicate::eq("dn", "cn=a,dc=nodomain") | Predicate::eq("gid", 1),
            Predicate::eq("dn", "cn=a,dc=nodomain") & Predicate::eq("dn", "cn=b,dc=nodomain"),
        ];
        for p in cases {
            let err = compiler.compile(&p).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_QUERY", "{p:?}");
        }
    }

    #[test]
    fn test_non_base_query_uses_model_base() {
        let meta = group_model().scoped("ou=contacts,dc=nodomain");
        let compiled = PredicateCompiler::new(&meta).compile(&Predicate::all()).unwrap();
        assert_eq!(compiled.base, "ou=contacts,dc=nodomain");
        assert_eq!(compiled.scope, Scope::Subtree);

        let request = compiled.to_request(vec!["cn".to_string()]);
        assert_eq!(request.filter, "(objectClass=posixGroup)");
        assert_eq!(request.attributes, vec!["cn"]);
    }
}
