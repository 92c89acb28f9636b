//! Schema text parser.
//!
//! Accepts the small XML subset schemas are written in: one
//! `<ExtentType>` root holding `<field>` children, attributes in single or
//! double quotes, comments, an optional `<?xml ...?>` prolog and the five
//! predefined entities. Anything else is a schema error.

use super::{FieldOrdering, FieldType, PadRecord, MAX_NAME_LEN};
use crate::error::{ExtentError, Result};

// ── Declarations ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(super) enum RelativeDecl {
    SelfPrevious,
    Field(usize),
}

#[derive(Debug, Clone)]
pub(super) struct FieldDecl {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub unique: bool,
    pub scale: Option<f64>,
    pub double_base: f64,
    pub relative: Option<RelativeDecl>,
}

#[derive(Debug, Clone)]
pub(super) struct SchemaDecl {
    pub name: String,
    pub namespace: String,
    pub version: (u32, u32),
    pub ordering: FieldOrdering,
    pub pad_record: PadRecord,
    pub fields: Vec<FieldDecl>,
}

fn schema_err(msg: impl Into<String>) -> ExtentError {
    ExtentError::Schema(msg.into())
}

// ── Element tree ────────────────────────────────────────────────────

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Skip whitespace, comments and processing instructions.
    fn skip_misc(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            let (open, close) = if self.rest().starts_with("<!--") {
                ("<!--", "-->")
            } else if self.rest().starts_with("<?") {
                ("<?", "?>")
            } else {
                return Ok(());
            };
            let end = self.rest()[open.len()..]
                .find(close)
                .ok_or_else(|| schema_err(format!("unterminated '{}'", open)))?;
            self.pos += open.len() + end + close.len();
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(schema_err(format!(
                "expected '{}' at byte {} of schema text",
                token, self.pos
            )))
        }
    }

    fn read_name(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(schema_err(format!("expected a name at byte {}", self.pos)));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn read_element(&mut self) -> Result<Element> {
        self.expect("<")?;
        let name = self.read_name()?.to_string();
        let mut attrs: Vec<(String, String)> = Vec::new();

        loop {
            self.skip_ws();
            if self.rest().starts_with("/>") {
                self.pos += 2;
                return Ok(Element {
                    name,
                    attrs,
                    children: Vec::new(),
                });
            }
            if self.rest().starts_with('>') {
                self.pos += 1;
                break;
            }
            let key = self.read_name()?.to_string();
            self.skip_ws();
            self.expect("=")?;
            self.skip_ws();
            let quote = match self.rest().chars().next() {
                Some(q @ ('"' | '\'')) => q,
                _ => return Err(schema_err(format!("attribute '{}' value must be quoted", key))),
            };
            self.pos += 1;
            let end = self
                .rest()
                .find(quote)
                .ok_or_else(|| schema_err(format!("unterminated value for '{}'", key)))?;
            let value = unescape(&self.rest()[..end])?;
            self.pos += end + 1;
            if attrs.iter().any(|(k, _)| *k == key) {
                return Err(schema_err(format!(
                    "duplicate attribute '{}' on <{}>",
                    key, name
                )));
            }
            attrs.push((key, value));
        }

        let mut children = Vec::new();
        loop {
            self.skip_misc()?;
            if self.at_end() {
                return Err(schema_err(format!("missing </{}>", name)));
            }
            if self.rest().starts_with("</") {
                self.pos += 2;
                let closing = self.read_name()?;
                if closing != name {
                    return Err(schema_err(format!(
                        "mismatched </{}>, expected </{}>",
                        closing, name
                    )));
                }
                self.skip_ws();
                self.expect(">")?;
                return Ok(Element {
                    name,
                    attrs,
                    children,
                });
            }
            if !self.rest().starts_with('<') {
                return Err(schema_err(format!(
                    "unexpected text inside <{}> at byte {}",
                    name, self.pos
                )));
            }
            children.push(self.read_element()?);
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| schema_err("unterminated entity in attribute value"))?;
        let entity = &rest[amp + 1..amp + semi];
        out.push(match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            other => return Err(schema_err(format!("unknown entity '&{};'", other))),
        });
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub(super) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// ── Schema interpretation ───────────────────────────────────────────

fn parse_yes_no(key: &str, value: &str) -> Result<bool> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(schema_err(format!(
            "{} must be 'yes' or 'no', got '{}'",
            key, other
        ))),
    }
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| schema_err(format!("{} must be a finite number, got '{}'", key, value)))
}

fn parse_version(value: &str) -> Result<(u32, u32)> {
    let (major, minor) = value
        .split_once('.')
        .ok_or_else(|| schema_err(format!("version must be 'major.minor', got '{}'", value)))?;
    match (major.parse(), minor.parse()) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        _ => Err(schema_err(format!(
            "version must be 'major.minor', got '{}'",
            value
        ))),
    }
}

fn is_option_key(key: &str) -> bool {
    key.starts_with("pack_") || key.starts_with("opt_")
}

pub(super) fn parse_schema(text: &str) -> Result<SchemaDecl> {
    let mut reader = Reader { src: text, pos: 0 };
    reader.skip_misc()?;
    let root = reader.read_element()?;
    reader.skip_misc()?;
    if !reader.at_end() {
        return Err(schema_err("trailing content after </ExtentType>"));
    }
    if root.name != "ExtentType" {
        return Err(schema_err(format!(
            "root element must be <ExtentType>, got <{}>",
            root.name
        )));
    }

    let name = root
        .attr("name")
        .ok_or_else(|| schema_err("<ExtentType> is missing a name"))?
        .to_string();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(schema_err(format!(
            "type name must be 1..={} bytes, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }

    let mut decl = SchemaDecl {
        name,
        namespace: root.attr("namespace").unwrap_or_default().to_string(),
        version: (0, 0),
        ordering: FieldOrdering::default(),
        pad_record: PadRecord::default(),
        fields: Vec::new(),
    };

    for (key, value) in &root.attrs {
        match key.as_str() {
            "version" => decl.version = parse_version(value)?,
            "pack_field_ordering" => {
                decl.ordering = FieldOrdering::from_token(value).ok_or_else(|| {
                    schema_err(format!("unknown pack_field_ordering '{}'", value))
                })?
            }
            "pack_pad_record" => {
                decl.pad_record = PadRecord::from_token(value)
                    .ok_or_else(|| schema_err(format!("unknown pack_pad_record '{}'", value)))?
            }
            k if is_option_key(k) => {
                return Err(schema_err(format!(
                    "unknown option '{}' on type '{}'",
                    k, decl.name
                )))
            }
            _ => {}
        }
    }

    for child in &root.children {
        if child.name != "field" {
            return Err(schema_err(format!(
                "unexpected <{}> inside <ExtentType>",
                child.name
            )));
        }
        let field = parse_field(child, &decl.fields)?;
        decl.fields.push(field);
    }

    if decl.fields.is_empty() {
        return Err(schema_err(format!("type '{}' declares no fields", decl.name)));
    }
    Ok(decl)
}

fn parse_field(elem: &Element, earlier: &[FieldDecl]) -> Result<FieldDecl> {
    let name = elem
        .attr("name")
        .ok_or_else(|| schema_err("<field> is missing a name"))?
        .to_string();
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(' ') {
        return Err(schema_err(format!("invalid field name '{}'", name)));
    }
    if earlier.iter().any(|f| f.name == name) {
        return Err(schema_err(format!("duplicate field name '{}'", name)));
    }
    let type_token = elem
        .attr("type")
        .ok_or_else(|| schema_err(format!("field '{}' is missing a type", name)))?;
    let field_type = FieldType::from_token(type_token)
        .ok_or_else(|| schema_err(format!("field '{}' has unknown type '{}'", name, type_token)))?;

    let mut field = FieldDecl {
        name,
        field_type,
        nullable: false,
        unique: false,
        scale: None,
        double_base: 0.0,
        relative: None,
    };

    for (key, value) in &elem.attrs {
        match key.as_str() {
            "opt_nullable" => field.nullable = parse_yes_no(key, value)?,
            "pack_unique" => {
                field.unique = parse_yes_no(key, value)?;
                if field.unique && field_type != FieldType::Variable32 {
                    return Err(schema_err(format!(
                        "pack_unique only applies to variable32 fields ('{}')",
                        field.name
                    )));
                }
            }
            "pack_scale" => {
                if field_type != FieldType::Double {
                    return Err(schema_err(format!(
                        "pack_scale only applies to double fields ('{}')",
                        field.name
                    )));
                }
                let scale = parse_f64(key, value)?;
                if scale == 0.0 {
                    return Err(schema_err(format!(
                        "pack_scale of '{}' must be non-zero",
                        field.name
                    )));
                }
                field.scale = Some(scale);
            }
            "opt_doublebase" => {
                if field_type != FieldType::Double {
                    return Err(schema_err(format!(
                        "opt_doublebase only applies to double fields ('{}')",
                        field.name
                    )));
                }
                field.double_base = parse_f64(key, value)?;
            }
            "pack_relative" => {
                if value == &field.name {
                    field.relative = Some(RelativeDecl::SelfPrevious);
                } else {
                    let base = earlier
                        .iter()
                        .position(|f| &f.name == value)
                        .ok_or_else(|| {
                            schema_err(format!(
                                "pack_relative of '{}' names unknown or later field '{}'",
                                field.name, value
                            ))
                        })?;
                    field.relative = Some(RelativeDecl::Field(base));
                }
            }
            "name" | "type" => {}
            k if is_option_key(k) => {
                return Err(schema_err(format!(
                    "unknown option '{}' on field '{}'",
                    k, field.name
                )))
            }
            _ => {}
        }
    }

    validate_relative(&field, earlier)?;
    Ok(field)
}

fn validate_relative(field: &FieldDecl, earlier: &[FieldDecl]) -> Result<()> {
    let Some(relative) = &field.relative else {
        return Ok(());
    };
    match field.field_type {
        FieldType::Int32 | FieldType::Int64 => {}
        FieldType::Double if field.scale.is_some() => {}
        FieldType::Double => {
            return Err(schema_err(format!(
                "pack_relative on double '{}' requires pack_scale",
                field.name
            )))
        }
        other => {
            return Err(schema_err(format!(
                "pack_relative does not apply to {} field '{}'",
                other.as_str(),
                field.name
            )))
        }
    }
    if let RelativeDecl::Field(base) = relative {
        let base = &earlier[*base];
        if base.field_type != field.field_type {
            return Err(schema_err(format!(
                "pack_relative base '{}' of '{}' must have the same type",
                base.name, field.name
            )));
        }
        if base.field_type == FieldType::Double && base.scale.is_none() {
            return Err(schema_err(format!(
                "pack_relative base '{}' of '{}' must use pack_scale",
                base.name, field.name
            )));
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn field_xml(body: &str) -> String {
        format!("<ExtentType name=\"T\" version=\"1.0\">{}</ExtentType>", body)
    }

    #[test]
    fn test_parse_full_schema() {
        let text = r#"<?xml version="1.0"?>
<!-- NFS common records -->
<ExtentType name="Trace::NFS" namespace="example.com" version="3.1"
            pack_field_ordering='big_to_small_sep_var32' comment="ignored">
  <field type="int64" name="time" pack_relative="time" />
  <!-- scaled -->
  <field type="double" name="lat" pack_scale="1e-6" opt_nullable="yes" />
  <field type="variable32" name="path" pack_unique="yes" />
  <field type="bool" name="is_&quot;odd&quot;" />
</ExtentType>
"#;
        let decl = parse_schema(text).unwrap();
        assert_eq!(decl.name, "Trace::NFS");
        assert_eq!(decl.namespace, "example.com");
        assert_eq!(decl.version, (3, 1));
        assert_eq!(decl.ordering, FieldOrdering::BigToSmall);
        assert_eq!(decl.fields.len(), 4);
        assert_eq!(decl.fields[0].relative, Some(RelativeDecl::SelfPrevious));
        assert_eq!(decl.fields[1].scale, Some(1e-6));
        assert!(decl.fields[1].nullable);
        assert!(decl.fields[2].unique);
        assert_eq!(decl.fields[3].name, "is_\"odd\"");
    }

    #[test]
    fn test_duplicate_field_is_schema_error() {
        let text = field_xml(r#"<field type="int32" name="a"/><field type="int64" name="a"/>"#);
        let err = parse_schema(&text).unwrap_err();
        assert!(matches!(err, ExtentError::Schema(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn test_unknown_type_is_schema_error() {
        let text = field_xml(r#"<field type="int128" name="a"/>"#);
        assert!(matches!(parse_schema(&text), Err(ExtentError::Schema(_))));
    }

    #[test]
    fn test_unknown_option_is_schema_error() {
        let text = field_xml(r#"<field type="int32" name="a" pack_magic="yes"/>"#);
        assert!(matches!(parse_schema(&text), Err(ExtentError::Schema(_))));
        let text = r#"<ExtentType name="T" opt_fast="yes"><field type="byte" name="a"/></ExtentType>"#;
        assert!(matches!(parse_schema(text), Err(ExtentError::Schema(_))));
    }

    #[test]
    fn test_relative_rules() {
        // base must be declared earlier
        let text = field_xml(r#"<field type="int64" name="a" pack_relative="b"/><field type="int64" name="b"/>"#);
        assert!(parse_schema(&text).is_err());
        // unscaled double cannot be relative
        let text = field_xml(r#"<field type="double" name="d" pack_relative="d"/>"#);
        assert!(parse_schema(&text).is_err());
        // scaled double against an unscaled base
        let text = field_xml(
            r#"<field type="double" name="a"/><field type="double" name="b" pack_scale="0.5" pack_relative="a"/>"#,
        );
        assert!(parse_schema(&text).is_err());
        // types must match
        let text = field_xml(r#"<field type="int32" name="a"/><field type="int64" name="b" pack_relative="a"/>"#);
        assert!(parse_schema(&text).is_err());

        let text = field_xml(r#"<field type="int32" name="a"/><field type="int32" name="b" pack_relative="a"/>"#);
        let decl = parse_schema(&text).unwrap();
        assert_eq!(decl.fields[1].relative, Some(RelativeDecl::Field(0)));
    }

    #[test]
    fn test_malformed_text() {
        assert!(parse_schema("").is_err());
        assert!(parse_schema("<ExtentType name=\"T\">").is_err());
        assert!(parse_schema("<Other name=\"T\"><field type=\"byte\" name=\"a\"/></Other>").is_err());
        assert!(parse_schema(&field_xml("text<field type=\"byte\" name=\"a\"/>")).is_err());
        assert!(parse_schema(&field_xml("")).is_err());
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let text = format!("<ExtentType name=\"{}\"><field type=\"byte\" name=\"a\"/></ExtentType>", long);
        assert!(parse_schema(&text).is_err());
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = "a<b>&\"c'";
        assert_eq!(unescape(&escape(raw)).unwrap(), raw);
    }
}
